use thiserror::Error;

/// Errors produced while decoding or encoding tunnel messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown message type: {0:?}")]
    UnknownType(String),

    #[error("Invalid base64 in {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("Unknown error code: {0}")]
    UnknownErrorCode(u8),
}
