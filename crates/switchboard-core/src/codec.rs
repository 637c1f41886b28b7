//! JSON text-frame codec for the gateway control stream.
//!
//! Wire format: one JSON object per WebSocket text frame.

use crate::error::{SbError, SbResult};
use crate::events::{InboundFrame, ServerEvent};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Maximum accepted inbound frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Encode an outbound event as a JSON text frame.
pub fn encode_event(event: &ServerEvent) -> SbResult<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode an inbound text frame into its event name and raw payload.
pub fn decode_frame(text: &str) -> SbResult<InboundFrame> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(SbError::InvalidEvent(format!(
            "frame too large: {} bytes (max {})",
            text.len(),
            MAX_FRAME_SIZE
        )));
    }
    serde_json::from_str(text).map_err(|e| SbError::Codec(format!("malformed frame: {e}")))
}

/// Parse the payload of `event` into its typed form.
///
/// A missing payload (`null`) is treated as an empty object so events whose
/// fields are all optional may omit `data` entirely.
pub fn parse_payload<T: DeserializeOwned>(event: &str, data: Value) -> SbResult<T> {
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data)
        .map_err(|e| SbError::InvalidEvent(format!("invalid `{event}` payload: {e}")))
}
