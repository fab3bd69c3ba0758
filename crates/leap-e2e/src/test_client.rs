//! Test client for E2E tests
//!
//! Runs a real [`ClientSession`] in the background and waits until its
//! channel is live on the server before handing control back to the test.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use leap::{ClientConfig, ClientError, ClientSession, SessionEvent, SessionState};

use crate::harness::TestServer;

/// A connected tunnel client
pub struct TestClient {
    /// Subdomain assigned by the server
    pub subdomain: String,
    session: Arc<ClientSession>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<(), ClientError>>>,
}

impl TestClient {
    /// Expose `local_port` through `server`, optionally asking for `subdomain`
    pub async fn connect(
        server: &TestServer,
        local_port: u16,
        subdomain: Option<&str>,
    ) -> Result<Self> {
        let config = ClientConfig {
            subdomain: subdomain.map(str::to_string),
            ..server.client_config(local_port)
        };
        Self::connect_with(server, config).await
    }

    /// Start a session with a custom configuration
    pub async fn connect_with(server: &TestServer, config: ClientConfig) -> Result<Self> {
        let session = Arc::new(ClientSession::new(config)?);
        let mut events = session.subscribe();
        let cancel = CancellationToken::new();

        let runner = session.clone();
        let token = cancel.clone();
        let mut handle = tokio::spawn(async move { runner.run(token).await });

        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(SessionEvent::StateChanged(SessionState::Connected)) => {
                            return Ok::<(), anyhow::Error>(());
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => bail!("Session dropped"),
                    },
                    result = &mut handle => {
                        return match result? {
                            Ok(()) => Err(anyhow::anyhow!("Session ended before connecting")),
                            Err(e) => Err(e.into()),
                        };
                    }
                }
            }
        })
        .await;

        match waited {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                cancel.cancel();
                return Err(e);
            }
            Err(_) => {
                cancel.cancel();
                bail!("Timed out waiting for the session to connect");
            }
        }

        let subdomain = session.subdomain().context("No subdomain assigned")?;

        // The client reports Connected once its handshake completes; the
        // server attaches the channel right after its side of the upgrade
        if !server.wait_connected(&subdomain).await {
            cancel.cancel();
            bail!("Tunnel {} never attached on the server", subdomain);
        }
        tracing::debug!("Test client connected on {}", subdomain);

        Ok(Self {
            subdomain,
            session,
            cancel,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> Option<SessionState> {
        self.session.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    /// Ask the session to disconnect and wait for it to finish
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.cancel.cancel();
        self.wait_finished().await
    }

    /// Wait for the session to end on its own
    pub async fn wait_finished(&mut self) -> Result<(), ClientError> {
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or(Err(ClientError::SessionFinished)),
            None => Err(ClientError::SessionFinished),
        }
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
