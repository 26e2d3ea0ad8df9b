//! Queue message body encoding
//!
//! Message bodies are base64 so that queue backends which require printable
//! payloads accept any task id.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::store::StoreError;

/// Encode a message body
pub fn encode_message(body: &str) -> String {
    STANDARD.encode(body.as_bytes())
}

/// Decode a message body produced by [`encode_message`]
pub fn decode_message(encoded: &str) -> Result<String, StoreError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| StoreError::Serialization(format!("invalid base64 message: {e}")))?;
    String::from_utf8(bytes)
        .map_err(|e| StoreError::Serialization(format!("message is not UTF-8: {e}")))
}
