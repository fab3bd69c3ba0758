use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use leap::{ClientConfig, ClientSession, SessionEvent};

/// Leap - expose a local HTTP service through a relay server
#[derive(Parser, Debug)]
#[command(name = "leap")]
#[command(about = "Expose a local HTTP service on a public subdomain")]
struct Cli {
    /// Relay server domain (e.g., leap.example.com)
    #[arg(short, long, env = "LEAP_DOMAIN")]
    domain: String,

    /// Requested subdomain (optional, assigned by the server if not specified)
    #[arg(short, long, env = "LEAP_SUBDOMAIN")]
    subdomain: Option<String>,

    /// Local port to expose
    #[arg(short, long, env = "LEAP_PORT")]
    port: u16,

    /// Use plain http/ws towards the relay server
    #[arg(long, env = "LEAP_INSECURE")]
    insecure: bool,

    /// Verbose logging
    #[arg(long, env = "LEAP_DEBUG")]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS operations
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(format!("leap={}", level).parse()?))
        .init();

    let config = ClientConfig {
        subdomain: cli.subdomain.filter(|s| !s.is_empty()),
        secure: !cli.insecure,
        ..ClientConfig::new(cli.domain, cli.port)
    };
    tracing::info!("Exposing {} through {}", config.local_addr(), config.domain);

    let session = ClientSession::new(config).context("Failed to create client")?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        leap_common::shutdown_signal().await;
        trigger.cancel();
    });

    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged(state)) => tracing::info!("State: {}", state),
                Ok(SessionEvent::Request(request)) => {
                    tracing::info!("{} {}", request.method, request.path);
                    for (name, value) in &request.headers {
                        tracing::debug!("  {}: {}", name, value);
                    }
                }
                Ok(SessionEvent::Error(message)) => tracing::debug!("Error: {}", message),
                Err(RecvError::Lagged(missed)) => tracing::debug!("Missed {} events", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });

    session.run(cancel).await.context("Tunnel session failed")?;
    Ok(())
}
