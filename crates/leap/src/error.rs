use leap_protocol::ProtocolError;
use tokio_tungstenite::tungstenite;

/// Errors that end a client session
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Subdomain {0:?} is occupied")]
    SubdomainOccupied(String),

    #[error("Failed to obtain connect token ({status}): {body}")]
    TokenRequestFailed { status: u16, body: String },

    #[error("Registration request failed: {0}")]
    Registration(#[from] reqwest::Error),

    #[error("Failed to open tunnel channel: {0}")]
    Dial(#[source] tungstenite::Error),

    #[error("Timed out opening tunnel channel")]
    DialTimedOut,

    #[error("Unexpectedly disconnected from leap server: {0}")]
    ChannelLost(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Session already finished")]
    SessionFinished,
}
