use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use leap_server::{LeapServer, ServerConfig};

/// Leap relay server - exposes local HTTP services through subdomains
#[derive(Parser, Debug)]
#[command(name = "leap-server")]
#[command(about = "Relay server for leap tunnels")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "server.toml")]
    config: String,

    /// Relay domain (overrides LEAP_DOMAIN and the config file)
    #[arg(short, long)]
    domain: Option<String>,

    /// Address to listen on (overrides LEAP_BIND and the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations; a second install is harmless
    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();

    let flags = ServerConfig {
        domain: args.domain,
        bind: args.bind,
        debug: args.debug.then_some(true),
        ..Default::default()
    };

    // Load and resolve configuration
    let config = ServerConfig::load_and_resolve(&args.config, flags)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    let level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("leap_server={}", level).parse()?)
                .add_directive(format!("leap_common={}", level).parse()?),
        )
        .init();

    tracing::info!("Domain: {}", config.domain);
    if let Some(timeout) = config.dispatch_timeout {
        tracing::info!("Dispatch timeout: {:?}", timeout);
    }

    let tls_acceptor = match &config.tls {
        Some(paths) => {
            tracing::info!("TLS: using {:?}", paths.cert);
            let tls_config = leap_common::load_server_config(&paths.cert, &paths.key)
                .context("Failed to load TLS configuration")?;
            Some(TlsAcceptor::from(Arc::new(tls_config)))
        }
        None => {
            tracing::info!("TLS: disabled (plain HTTP)");
            None
        }
    };

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        leap_common::shutdown_signal().await;
        tracing::info!("Shutdown signal received, cleaning up...");
        trigger.cancel();
    });

    let server = LeapServer::new(&config, tls_acceptor);
    server
        .run(config.bind, shutdown)
        .await
        .with_context(|| format!("Failed to serve on {}", config.bind))?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
