//! Server-sent-event framing for streamed responses
//!
//! The HTTP surface is out of scope; these helpers define the wire format
//! it uses: line-delimited `data: <json>` frames terminated by
//! `data: [DONE]`.

use serde::Serialize;

/// Terminator frame closing every event stream
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Encode one event as an SSE data frame
pub fn frame<T: Serialize>(event: &T) -> String {
    match serde_json::to_string(event) {
        Ok(json) => format!("data: {}\n\n", json),
        Err(_) => DONE_FRAME.to_string(),
    }
}
