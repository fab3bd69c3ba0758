//! Test server harness for E2E tests
//!
//! Starts a complete leap server on 127.0.0.1 with an ephemeral port. The
//! relay domain is the listener address itself, so control-plane requests
//! go straight to `http://127.0.0.1:<port>` and tunnel requests carry a
//! `Host: <subdomain>.127.0.0.1:<port>` header.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use leap::ClientConfig;
use leap_server::{LeapServer, ResolvedServerConfig, TunnelRegistry};

/// A running test server instance
pub struct TestServer {
    /// Listener address
    pub addr: SocketAddr,
    /// Relay domain the server was configured with
    pub domain: String,
    server: Arc<LeapServer>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}

impl TestServer {
    /// Start a test server with default settings
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start a test server, adjusting the configuration first
    pub async fn start_with(configure: impl FnOnce(&mut ResolvedServerConfig)) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test server");
        let addr = listener.local_addr().unwrap();
        let domain = addr.to_string();

        let mut config = ResolvedServerConfig::new(domain.clone(), addr);
        configure(&mut config);

        let server = LeapServer::new(&config, None);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.clone().run_with_listener(listener, shutdown.clone()));

        Self {
            addr,
            domain,
            server,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        self.server.registry()
    }

    /// Control-plane URL for `path`
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Host header value for a subdomain
    pub fn host_for(&self, subdomain: &str) -> String {
        format!("{}.{}", subdomain, self.domain)
    }

    /// Client configuration pointing at this server over plain http/ws
    pub fn client_config(&self, local_port: u16) -> ClientConfig {
        ClientConfig {
            secure: false,
            ..ClientConfig::new(self.domain.clone(), local_port)
        }
    }

    /// Wait until the tunnel on `subdomain` has a live channel
    pub async fn wait_connected(&self, subdomain: &str) -> bool {
        self.wait_until(|registry| registry.get(subdomain).is_some_and(|t| t.is_connected()))
            .await
    }

    /// Wait until the tunnel on `subdomain` is gone from the registry
    pub async fn wait_removed(&self, subdomain: &str) -> bool {
        self.wait_until(|registry| registry.get(subdomain).is_none()).await
    }

    async fn wait_until(&self, check: impl Fn(&TunnelRegistry) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check(self.registry()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Trigger shutdown and wait for the server to stop; returns how long it took
    pub async fn stop(&mut self) -> Duration {
        let started = Instant::now();
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        started.elapsed()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
