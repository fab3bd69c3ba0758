//! Wire protocol shared by the Leap relay server and client.
//!
//! Two surfaces live here: the messages exchanged over a tunnel channel and
//! the JSON bodies of the control-plane HTTP API.

mod api;
mod error;
mod messages;

pub use api::{
    StatusResponse, SubdomainRequest, TokenResponse, CONNECT_PATH, STATUS_PATH, TOKEN_QUERY,
    TUNNEL_PATH,
};
pub use error::ProtocolError;
pub use messages::{ErrorCode, Message};
