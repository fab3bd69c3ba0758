//! Leap relay server library
//!
//! Exposes local HTTP services through subdomains of a relay domain. It can
//! be embedded in other applications or driven from tests.

mod channel;
mod config;
mod proxy;
mod registry;
mod server;
mod takeover;
mod tunnel;

// Re-export public types
pub use channel::FrameError;
pub use config::{ResolvedServerConfig, ServerConfig, TlsPaths};
pub use proxy::{error_status, serialize_request};
pub use registry::{RegistryError, TunnelRegistry};
pub use server::{route_host, LeapServer, Route};
pub use takeover::{Takeover, TakeoverError, TakeoverIo};
pub use tunnel::{
    generate_token, Delivery, DispatchError, Outbound, Reply, Tunnel, TOKEN_LENGTH,
};
