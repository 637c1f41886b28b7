//! switchboard-core: shared protocol library for the switchboard gateway.
//!
//! Provides the JSON wire events, frame codec, identity/role model,
//! error type and HMAC bearer tokens.

pub mod codec;
pub mod error;
pub mod events;
pub mod identity;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{decode_frame, encode_event, parse_payload};
pub use error::{SbError, SbResult};
pub use events::{now_millis, ChatMessage, InboundFrame, QueuedMessage, ServerEvent};
pub use identity::{generate_id, Identity, Role};
pub use token::{create_token, generate_secret, verify_token, Claims};
