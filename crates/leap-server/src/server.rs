use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures_util::future::join_all;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use leap_protocol::{
    StatusResponse, SubdomainRequest, TokenResponse, CONNECT_PATH, STATUS_PATH, TOKEN_QUERY,
    TUNNEL_PATH,
};

use crate::channel;
use crate::config::ResolvedServerConfig;
use crate::proxy::{error_status, json_response, serialize_request, taken_over_response, text_response};
use crate::registry::{RegistryError, TunnelRegistry};
use crate::takeover::{Takeover, TakeoverIo};
use crate::tunnel::{DispatchError, Reply, Tunnel};

type HttpResponse = Response<Full<Bytes>>;

/// Where a request goes, decided by its Host header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The relay's own domain: control-plane API
    Control,
    /// A subdomain of the relay's domain
    Tunnel(String),
    /// Anything else
    Unknown,
}

/// Resolve a Host header against the relay domain
///
/// The port is ignored unless the configured domain carries one itself.
pub fn route_host(host: &str, domain: &str) -> Route {
    let lowered = host.to_ascii_lowercase();
    let host = if domain.contains(':') {
        lowered.as_str()
    } else {
        strip_port(&lowered)
    };

    if host == domain {
        return Route::Control;
    }
    match host
        .strip_suffix(domain)
        .and_then(|prefix| prefix.strip_suffix('.'))
        .and_then(|prefix| prefix.split('.').next())
    {
        Some(label) if !label.is_empty() => Route::Tunnel(label.to_string()),
        _ => Route::Unknown,
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

/// Leap relay server: control-plane API, tunnel channels and public proxying
/// on a single listener
pub struct LeapServer {
    domain: String,
    registry: Arc<TunnelRegistry>,
    tls_acceptor: Option<TlsAcceptor>,
    dispatch_timeout: Option<Duration>,
    pending_ttl: Duration,
    shutdown_grace: Duration,
    tracker: TaskTracker,
}

impl LeapServer {
    pub fn new(config: &ResolvedServerConfig, tls_acceptor: Option<TlsAcceptor>) -> Arc<Self> {
        Arc::new(Self {
            domain: config.domain.clone(),
            registry: TunnelRegistry::new(),
            tls_acceptor,
            dispatch_timeout: config.dispatch_timeout,
            pending_ttl: config.pending_ttl,
            shutdown_grace: config.shutdown_grace,
            tracker: TaskTracker::new(),
        })
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Bind `addr` and serve until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` is cancelled
    pub async fn run_with_listener(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        if self.tls_acceptor.is_some() {
            tracing::info!("Leap server listening on {} (HTTPS), domain {}", addr, self.domain);
        } else {
            tracing::info!("Leap server listening on {}, domain {}", addr, self.domain);
        }

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            tracing::debug!("Connection from {}", peer_addr);

            let this = self.clone();
            self.tracker.spawn(async move {
                if let Some(ref acceptor) = this.tls_acceptor {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => this.serve_connection(tls_stream, peer_addr).await,
                        Err(e) => {
                            tracing::warn!("TLS handshake failed from {}: {}", peer_addr, e);
                        }
                    }
                } else {
                    this.serve_connection(stream, peer_addr).await;
                }
            });
        }

        drop(listener);
        self.shutdown().await;
        Ok(())
    }

    /// Close every channel, then give open connections the grace period
    async fn shutdown(&self) {
        let tunnels = self.registry.connected();
        tracing::info!("Shutting down, closing {} tunnel(s)", tunnels.len());

        join_all(tunnels.iter().map(|tunnel| tunnel.close(true))).await;

        self.tracker.close();
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "{} connection(s) still open after {:?}, exiting anyway",
                self.tracker.len(),
                self.shutdown_grace
            );
        }
        tracing::info!("Leap server stopped");
    }

    /// Serve one HTTP request on any AsyncRead + AsyncWrite stream
    async fn serve_connection<S>(self: Arc<Self>, stream: S, peer_addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (io, takeover) = TakeoverIo::new(stream);

        let service = service_fn(move |req| {
            let this = self.clone();
            let takeover = takeover.clone();
            async move { this.handle_request(req, takeover).await }
        });

        // Every non-upgrade response carries `Connection: close`, so hyper serves one
        // request per connection and a takeover never follows an earlier response
        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades()
            .await
        {
            tracing::debug!("HTTP connection error from {}: {}", peer_addr, e);
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        takeover: Takeover,
    ) -> Result<HttpResponse, Infallible> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .unwrap_or("")
            .to_string();

        tracing::debug!("{} {} (Host: {})", req.method(), req.uri(), host);

        let response = match route_host(&host, &self.domain) {
            Route::Control => self.handle_control(req).await,
            Route::Tunnel(subdomain) => self.handle_proxy(&subdomain, req, &takeover).await,
            Route::Unknown => text_response(StatusCode::NOT_FOUND, "Not found"),
        };
        Ok(response)
    }

    async fn handle_control(&self, req: Request<Incoming>) -> HttpResponse {
        match (req.method(), req.uri().path()) {
            (&Method::GET, STATUS_PATH) => self.status(),
            (&Method::POST, TUNNEL_PATH) => self.create_tunnel(req).await,
            (&Method::GET, CONNECT_PATH) => self.connect_tunnel(req),
            _ => text_response(StatusCode::NOT_FOUND, "Not found"),
        }
    }

    fn status(&self) -> HttpResponse {
        let status = StatusResponse {
            subdomains: self.registry.count(),
        };
        match serde_json::to_vec(&status) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    async fn create_tunnel(&self, req: Request<Incoming>) -> HttpResponse {
        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Failed to read tunnel request body: {}", e);
                return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };
        let request: SubdomainRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return text_response(StatusCode::BAD_REQUEST, format!("Malformed tunnel request: {}", e));
            }
        };

        let tunnel = match self.registry.create(&request.subdomain) {
            Ok(tunnel) => tunnel,
            Err(RegistryError::Conflict(name)) => {
                tracing::info!("Subdomain {:?} already taken", name);
                return text_response(
                    StatusCode::CONFLICT,
                    format!("A tunnel on the subdomain {:?} already exists", name),
                );
            }
            Err(e @ RegistryError::InvalidSubdomain(_)) => {
                return text_response(StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        tracing::info!("Created tunnel {}", tunnel.subdomain());
        self.reap_if_never_connected(&tunnel);

        let token = TokenResponse {
            subdomain: tunnel.subdomain().to_string(),
            token: tunnel.token().to_string(),
        };
        match serde_json::to_vec(&token) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                self.registry.remove(tunnel.subdomain());
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    fn reap_if_never_connected(&self, tunnel: &Tunnel) {
        let registry = self.registry.clone();
        let subdomain = tunnel.subdomain().to_string();
        let token = tunnel.token().to_string();
        let ttl = self.pending_ttl;

        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if registry.remove_if_pending(&subdomain, &token) {
                tracing::info!("Tunnel {} was never connected, removed", subdomain);
            }
        });
    }

    fn connect_tunnel(&self, req: Request<Incoming>) -> HttpResponse {
        let token = req
            .uri()
            .query()
            .and_then(|q| query_param(q, TOKEN_QUERY))
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let Some(token) = token else {
            return text_response(StatusCode::BAD_REQUEST, "Missing token query argument");
        };

        let Some(accept) = channel::accept_key(req.headers()) else {
            return text_response(StatusCode::BAD_REQUEST, "Expected a websocket upgrade");
        };

        let Some(tunnel) = self.registry.claim_by_token(&token) else {
            return text_response(StatusCode::BAD_REQUEST, "Invalid token");
        };

        let registry = self.registry.clone();
        self.tracker.spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    tracing::warn!("Channel upgrade for {} failed: {}", tunnel.subdomain(), e);
                    registry.remove(tunnel.subdomain());
                    return;
                }
            };

            let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
            tracing::info!("Client {} connected", tunnel.subdomain());

            channel::run_channel(tunnel.clone(), ws).await;

            registry.remove(tunnel.subdomain());
            tracing::info!("Client {} disconnected", tunnel.subdomain());
        });

        channel::switching_protocols(&accept)
    }

    async fn handle_proxy(
        &self,
        subdomain: &str,
        req: Request<Incoming>,
        takeover: &Takeover,
    ) -> HttpResponse {
        let Some(tunnel) = self.registry.get(subdomain) else {
            tracing::debug!("No tunnel for subdomain: {}", subdomain);
            return text_response(StatusCode::NOT_FOUND, format!("Tunnel not found for: {}", subdomain));
        };

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::warn!("Failed to read request body: {}", e);
                return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };
        let raw_request = serialize_request(&parts, &body);

        match tunnel.dispatch(raw_request, self.dispatch_timeout).await {
            Ok(Reply::Data(raw_response)) => match takeover.claim(Bytes::from(raw_response)) {
                Ok(()) => taken_over_response(),
                Err(e) => {
                    tracing::error!("Cannot relay response for {}: {}", subdomain, e);
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to relay response")
                }
            },
            Ok(Reply::Error(code)) => {
                tracing::debug!("Tunnel {} answered {}", subdomain, code);
                let (status, message) = error_status(code);
                text_response(status, message)
            }
            Err(e @ (DispatchError::NotConnected(_) | DispatchError::ChannelClosed)) => {
                tracing::warn!("Proxy to {} failed: {}", subdomain, e);
                text_response(StatusCode::BAD_GATEWAY, e.to_string())
            }
            Err(DispatchError::TimedOut) => {
                tracing::warn!("Tunnel {} did not answer in time", subdomain);
                text_response(StatusCode::GATEWAY_TIMEOUT, "Tunnel response timeout")
            }
            Err(e @ DispatchError::Encode(_)) => {
                tracing::error!("Proxy to {} failed: {}", subdomain, e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}
