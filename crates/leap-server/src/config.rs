//! Server configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Command-line flags (applied by the binary before resolving)
//! 2. Environment variables (LEAP_*)
//! 3. Config file (server.toml)
//! 4. Default values (where applicable)

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable prefix
const ENV_PREFIX: &str = "LEAP";

const DEFAULT_BIND: &str = "0.0.0.0:8080";
const DEFAULT_PENDING_TTL_SECS: u64 = 60;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1000;

/// Server configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Relay domain; its subdomains are routed to tunnels (e.g., "leap.example.com")
    pub domain: Option<String>,

    /// Address to bind the public listener to
    pub bind: Option<String>,

    /// Verbose logging
    pub debug: Option<bool>,

    /// TLS certificate chain (PEM file) for terminating HTTPS on the listener
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM file)
    pub tls_key: Option<PathBuf>,

    /// Upper bound on how long a public request waits for a tunnel reply
    pub dispatch_timeout_secs: Option<u64>,

    /// How long a created tunnel may stay unconnected before it is dropped
    pub pending_ttl_secs: Option<u64>,

    /// How long shutdown waits for connections to finish
    pub shutdown_grace_ms: Option<u64>,
}

/// Fully resolved server configuration
#[derive(Debug, Clone)]
pub struct ResolvedServerConfig {
    pub domain: String,
    pub bind: SocketAddr,
    pub debug: bool,
    pub tls: Option<TlsPaths>,
    pub dispatch_timeout: Option<Duration>,
    pub pending_ttl: Duration,
    pub shutdown_grace: Duration,
}

/// Certificate and key files for the listener
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl ResolvedServerConfig {
    /// Defaults for everything but the domain and bind address
    pub fn new(domain: impl Into<String>, bind: SocketAddr) -> Self {
        Self {
            domain: domain.into().to_lowercase(),
            bind,
            debug: false,
            tls: None,
            dispatch_timeout: None,
            pending_ttl: Duration::from_secs(DEFAULT_PENDING_TTL_SECS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Get environment variable as u64
fn get_env_u64(name: &str) -> Option<u64> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as bool ("1", "true", "yes")
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

impl ServerConfig {
    /// Load configuration from a TOML file (optional)
    pub fn load(path: &str) -> Self {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse {}: {}", path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", path, e);
                }
            }
        }
        Self::default()
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        self.resolve_with(ServerConfig::default())
    }

    /// Resolve with `flags` (from the command line) taking priority over everything
    pub fn resolve_with(self, flags: ServerConfig) -> anyhow::Result<ResolvedServerConfig> {
        // Domain: flag > ENV > config > required
        let domain = flags
            .domain
            .or_else(|| get_env("DOMAIN"))
            .or(self.domain)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Domain required. Set LEAP_DOMAIN or domain in config"))?;

        // Bind: flag > ENV > config > default 0.0.0.0:8080
        let bind_str = flags
            .bind
            .or_else(|| get_env("BIND"))
            .or(self.bind)
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind: SocketAddr = bind_str
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {:?}: {}", bind_str, e))?;

        let debug = flags
            .debug
            .or_else(|| get_env_bool("DEBUG"))
            .or(self.debug)
            .unwrap_or(false);

        // TLS: both files or neither
        let tls_cert = get_env("TLS_CERT").map(PathBuf::from).or(self.tls_cert);
        let tls_key = get_env("TLS_KEY").map(PathBuf::from).or(self.tls_key);
        let tls = match (tls_cert, tls_key) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => anyhow::bail!("TLS needs both a certificate and a key (LEAP_TLS_CERT, LEAP_TLS_KEY)"),
        };

        let dispatch_timeout = get_env_u64("DISPATCH_TIMEOUT_SECS")
            .or(self.dispatch_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let pending_ttl = Duration::from_secs(
            get_env_u64("PENDING_TTL_SECS")
                .or(self.pending_ttl_secs)
                .unwrap_or(DEFAULT_PENDING_TTL_SECS),
        );

        let shutdown_grace = Duration::from_millis(
            get_env_u64("SHUTDOWN_GRACE_MS")
                .or(self.shutdown_grace_ms)
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
        );

        Ok(ResolvedServerConfig {
            domain: domain.to_lowercase(),
            bind,
            debug,
            tls,
            dispatch_timeout,
            pending_ttl,
            shutdown_grace,
        })
    }

    /// Load config file and resolve with environment variable and flag overrides
    pub fn load_and_resolve(path: &str, flags: ServerConfig) -> anyhow::Result<ResolvedServerConfig> {
        Self::load(path).resolve_with(flags)
    }
}
