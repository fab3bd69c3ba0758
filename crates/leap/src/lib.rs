//! Leap tunnel client library
//!
//! Registers a tunnel with a relay server, keeps the channel open and answers
//! every relayed request by forwarding it to a local port.

mod config;
mod error;
mod forwarder;
mod session;

pub use config::ClientConfig;
pub use error::ClientError;
pub use forwarder::{ForwardError, LocalForwarder};
pub use session::{ClientSession, RequestSummary, SessionEvent, SessionState};
