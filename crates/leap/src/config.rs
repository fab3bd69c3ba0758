use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DISCONNECT_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay server domain, optionally with a port (e.g., "leap.example.com")
    pub domain: String,

    /// Requested subdomain (None = server picks one)
    pub subdomain: Option<String>,

    /// Port of the local service on 127.0.0.1
    pub local_port: u16,

    /// Use https/wss towards the relay
    pub secure: bool,

    /// Bound on connecting to the local service
    pub dial_timeout: Duration,

    /// Bound on writing a request to and reading a response from the local service
    pub io_timeout: Duration,

    /// How long a graceful disconnect waits for the server's close reply
    pub disconnect_grace: Duration,

    /// Bound on the registration call and on opening the channel
    pub registration_timeout: Duration,
}

impl ClientConfig {
    pub fn new(domain: impl Into<String>, local_port: u16) -> Self {
        Self {
            domain: domain.into(),
            subdomain: None,
            local_port,
            secure: true,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
        }
    }

    fn http_scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    fn ws_scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    /// Control-plane URL for `path`
    pub fn http_url(&self, path: &str) -> String {
        format!("{}://{}{}", self.http_scheme(), self.domain, path)
    }

    /// Channel URL for `path`
    pub fn ws_url(&self, path: &str) -> String {
        format!("{}://{}{}", self.ws_scheme(), self.domain, path)
    }

    /// Local service address
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_port))
    }

    /// Public URL of the tunnel once `subdomain` is assigned
    pub fn public_url(&self, subdomain: &str) -> String {
        format!("{}://{}.{}", self.http_scheme(), subdomain, self.domain)
    }
}
