//! switchboard-server: real-time delivery gateway for support chat.
//!
//! Admits authenticated WebSocket connections, tracks presence per identity,
//! enforces a shared per-identity connection quota, evicts silent connections
//! and parks messages for offline recipients until they reconnect.

pub mod auth;
pub mod config;
pub mod gateway;
pub mod liveness;
pub mod messages;
pub mod presence;
pub mod queue;
pub mod reconnect;
pub mod server;
pub mod store;
pub mod transport;

pub use config::{CliOverrides, GatewayConfig};
pub use gateway::{ConnectionContext, Gateway, Rejection};
pub use server::SwitchboardServer;
