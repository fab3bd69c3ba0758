use serde::{Deserialize, Serialize};

/// Control-plane endpoint that allocates a tunnel
pub const TUNNEL_PATH: &str = "/api/tunnel";

/// Control-plane endpoint that upgrades to the tunnel channel
pub const CONNECT_PATH: &str = "/api/connect";

/// Control-plane endpoint reporting server status
pub const STATUS_PATH: &str = "/api/status";

/// Query parameter carrying the connect token
pub const TOKEN_QUERY: &str = "token";

/// Body of `POST /api/tunnel`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubdomainRequest {
    /// Requested subdomain (empty = server picks one)
    #[serde(default)]
    pub subdomain: String,
}

/// Successful reply to `POST /api/tunnel`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Subdomain assigned to the tunnel
    pub subdomain: String,
    /// One-time credential for `GET /api/connect`
    pub token: String,
}

/// Reply to `GET /api/status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Number of registered tunnels
    pub subdomains: usize,
}
