//! Client session: registration, channel lifecycle and the relay loop
//!
//! A session moves through `GettingToken -> Connecting -> Connected ->
//! Disconnecting -> Disconnected`. A session that fails before a graceful
//! disconnect drops straight to `Disconnected`. Observers subscribe to a
//! broadcast of [`SessionEvent`]s; the only control they have over the
//! session is the cancellation token passed to [`ClientSession::run`].

use std::fmt;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use leap_protocol::{
    ErrorCode, Message, ProtocolError, SubdomainRequest, TokenResponse, CONNECT_PATH, TOKEN_QUERY,
    TUNNEL_PATH,
};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::forwarder::LocalForwarder;

/// Capacity of the event broadcast; slow observers miss old events
const EVENT_CAPACITY: usize = 64;

/// Requests decoded by the reader but not yet answered
const INBOUND_CAPACITY: usize = 16;

/// Lifecycle of a client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    GettingToken,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl SessionState {
    /// Whether the session may move from `self` to `next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (GettingToken, Connecting)
            | (Connecting, Connected)
            | (Connected, Disconnecting)
            | (Disconnecting, Disconnected) => true,
            (current, Disconnected) => current != Disconnected,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::GettingToken => "Getting Token",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

/// Head of a relayed request, for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl RequestSummary {
    /// Parse the request line and headers of a raw request
    ///
    /// `None` for a malformed or truncated head.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(raw) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) | Err(_) => return None,
        }

        Some(Self {
            method: request.method.unwrap_or_default().to_string(),
            path: request.path.unwrap_or_default().to_string(),
            headers: request
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
        })
    }
}

/// Notifications published by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Request(RequestSummary),
    Error(String),
}

/// How the channel reader stopped
#[derive(Debug)]
enum ReaderEnd {
    /// The server sent a close frame
    Closed(Option<CloseCode>),
    /// The connection failed or ended without a close frame
    Lost(String),
}

/// How the relay loop stopped
enum RelayEnd {
    Cancelled,
    ReaderDone,
    WriteFailed(String),
}

/// One tunnel client
pub struct ClientSession {
    config: ClientConfig,
    forwarder: LocalForwarder,
    http: reqwest::Client,
    state: Mutex<Option<SessionState>>,
    subdomain: Mutex<Option<String>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.registration_timeout)
            .build()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            forwarder: LocalForwarder::from_config(&config),
            config,
            http,
            state: Mutex::new(None),
            subdomain: Mutex::new(None),
            events,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Current state; `None` before [`ClientSession::run`] starts
    pub fn state(&self) -> Option<SessionState> {
        *self.state.lock()
    }

    /// Subdomain assigned by the server, once registered
    pub fn subdomain(&self) -> Option<String> {
        self.subdomain.lock().clone()
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn report(&self, message: String) {
        tracing::warn!("{}", message);
        self.publish(SessionEvent::Error(message));
    }

    /// Move to `next`, notifying observers; illegal moves are refused
    fn set_state(&self, next: SessionState) -> bool {
        {
            let mut state = self.state.lock();
            let allowed = match *state {
                None => next == SessionState::GettingToken,
                Some(current) if current == next => return true,
                Some(current) => current.can_transition_to(next),
            };
            if !allowed {
                tracing::error!("Refusing state change {:?} -> {}", *state, next);
                return false;
            }
            *state = Some(next);
        }
        tracing::debug!("Session state: {}", next);
        self.publish(SessionEvent::StateChanged(next));
        true
    }

    fn abort(&self, error: ClientError) -> ClientError {
        self.publish(SessionEvent::Error(error.to_string()));
        self.set_state(SessionState::Disconnected);
        error
    }

    /// Register, connect and relay until `cancel` fires or the channel closes
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        if !self.set_state(SessionState::GettingToken) {
            return Err(ClientError::SessionFinished);
        }

        let token = tokio::select! {
            _ = cancel.cancelled() => {
                self.set_state(SessionState::Disconnected);
                return Ok(());
            }
            token = self.request_token() => match token {
                Ok(token) => token,
                Err(e) => return Err(self.abort(e)),
            },
        };

        tracing::info!(
            "Tunnel assigned: {} -> {}",
            self.config.public_url(&token.subdomain),
            self.forwarder.addr()
        );
        *self.subdomain.lock() = Some(token.subdomain);
        self.set_state(SessionState::Connecting);

        let url = format!(
            "{}?{}={}",
            self.config.ws_url(CONNECT_PATH),
            TOKEN_QUERY,
            token.token
        );
        let dial = tokio::time::timeout(
            self.config.registration_timeout,
            tokio_tungstenite::connect_async(url),
        );
        let ws = tokio::select! {
            _ = cancel.cancelled() => {
                self.set_state(SessionState::Disconnected);
                return Ok(());
            }
            dialed = dial => match dialed {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => return Err(self.abort(ClientError::Dial(e))),
                Err(_) => return Err(self.abort(ClientError::DialTimedOut)),
            },
        };

        self.set_state(SessionState::Connected);
        self.relay(ws, cancel).await
    }

    async fn request_token(&self) -> Result<TokenResponse, ClientError> {
        let requested = self.config.subdomain.clone().unwrap_or_default();
        let body = SubdomainRequest {
            subdomain: requested.clone(),
        };

        let response = self
            .http
            .post(self.config.http_url(TUNNEL_PATH))
            .json(&body)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json::<TokenResponse>().await?),
            StatusCode::CONFLICT => Err(ClientError::SubdomainOccupied(requested)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ClientError::TokenRequestFailed {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    /// Answer relayed requests until cancelled or the channel closes
    async fn relay<S>(&self, ws: WebSocketStream<S>, cancel: CancellationToken) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, stream) = ws.split();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut reader = tokio::spawn(read_channel(stream, inbound_tx));

        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break RelayEnd::Cancelled,
                inbound = inbound_rx.recv() => {
                    let Some(inbound) = inbound else {
                        break RelayEnd::ReaderDone;
                    };
                    let reply = match self.answer(inbound).await.encode() {
                        Ok(text) => text,
                        Err(e) => break RelayEnd::WriteFailed(format!("failed to encode reply: {}", e)),
                    };
                    if let Err(e) = sink.send(WsMessage::text(reply)).await {
                        break RelayEnd::WriteFailed(e.to_string());
                    }
                }
            }
        };

        match end {
            RelayEnd::Cancelled => {
                self.set_state(SessionState::Disconnecting);
                self.disconnect(&mut sink, &mut reader).await;
                self.set_state(SessionState::Disconnected);
                Ok(())
            }
            RelayEnd::ReaderDone => {
                let outcome = reader
                    .await
                    .unwrap_or_else(|e| ReaderEnd::Lost(format!("reader task failed: {}", e)));
                match outcome {
                    ReaderEnd::Closed(code @ (None | Some(CloseCode::Normal) | Some(CloseCode::Away))) => {
                        tracing::info!("Server closed the tunnel ({:?})", code);
                        // Flush the close reply
                        let _ = tokio::time::timeout(self.config.disconnect_grace, sink.close()).await;
                        self.set_state(SessionState::Disconnected);
                        Ok(())
                    }
                    ReaderEnd::Closed(Some(code)) => {
                        Err(self.abort(ClientError::ChannelLost(format!("closed with {}", code))))
                    }
                    ReaderEnd::Lost(reason) => Err(self.abort(ClientError::ChannelLost(reason))),
                }
            }
            RelayEnd::WriteFailed(reason) => {
                reader.abort();
                Err(self.abort(ClientError::ChannelLost(reason)))
            }
        }
    }

    /// Send a close frame and wait a bounded time for the server's reply
    async fn disconnect<Snk>(&self, sink: &mut Snk, reader: &mut JoinHandle<ReaderEnd>)
    where
        Snk: futures_util::Sink<WsMessage> + Unpin,
        Snk::Error: fmt::Display,
    {
        let grace = self.config.disconnect_grace;
        let close = WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "closing".into(),
        }));

        match tokio::time::timeout(grace, sink.send(close)).await {
            Ok(Ok(())) => match tokio::time::timeout(grace, &mut *reader).await {
                Ok(Ok(ReaderEnd::Closed(_))) => tracing::debug!("Server acknowledged close"),
                Ok(Ok(ReaderEnd::Lost(reason))) => tracing::debug!("Channel ended during close: {}", reason),
                Ok(Err(e)) => tracing::debug!("Reader task failed: {}", e),
                Err(_) => tracing::warn!("Server did not acknowledge close within {:?}", grace),
            },
            Ok(Err(e)) => tracing::debug!("Failed to send close frame: {}", e),
            Err(_) => tracing::warn!("Timed out sending close frame"),
        }
        reader.abort();
    }

    /// Produce the reply for one inbound request
    async fn answer(&self, inbound: Result<Vec<u8>, ProtocolError>) -> Message {
        let raw = match inbound {
            Ok(raw) => raw,
            Err(e) => {
                self.report(format!("Malformed request: {}", e));
                return Message::ResponseError(ErrorCode::Internal);
            }
        };

        match RequestSummary::parse(&raw) {
            Some(summary) => self.publish(SessionEvent::Request(summary)),
            None => tracing::debug!("Could not parse relayed request head"),
        }

        match self.forwarder.forward(&raw).await {
            Ok(response) => Message::ResponseData(response),
            Err(e) => {
                self.report(format!("Request error: {}", e));
                Message::ResponseError(e.code())
            }
        }
    }
}

/// Decode inbound frames and hand requests to the relay loop
async fn read_channel<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    inbound: mpsc::Sender<Result<Vec<u8>, ProtocolError>>,
) -> ReaderEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = stream.next().await {
        let data = match frame {
            Ok(WsMessage::Text(text)) => Message::decode(text.as_bytes()),
            Ok(WsMessage::Binary(data)) => Message::decode(&data),
            Ok(WsMessage::Close(frame)) => return ReaderEnd::Closed(frame.map(|f| f.code)),
            Ok(_) => continue,
            Err(e) => return ReaderEnd::Lost(e.to_string()),
        };

        let request = match data {
            Ok(Message::Request(raw)) => Ok(raw),
            Ok(other) => {
                tracing::warn!("Ignoring unexpected {} message", other.kind());
                continue;
            }
            Err(e @ ProtocolError::Payload { kind: "request", .. }) => Err(e),
            Err(e) => {
                tracing::warn!("Ignoring malformed frame: {}", e);
                continue;
            }
        };

        if inbound.send(request).await.is_err() {
            break;
        }
    }
    ReaderEnd::Lost("connection closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Role;

    fn session(local_port: u16) -> ClientSession {
        let config = ClientConfig {
            secure: false,
            disconnect_grace: Duration::from_millis(500),
            io_timeout: Duration::from_millis(500),
            ..ClientConfig::new("leap.test", local_port)
        };
        ClientSession::new(config).unwrap()
    }

    fn connected(session: &ClientSession) {
        assert!(session.set_state(SessionState::GettingToken));
        assert!(session.set_state(SessionState::Connecting));
        assert!(session.set_state(SessionState::Connected));
    }

    async fn channel_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    async fn next_reply(server: &mut WebSocketStream<DuplexStream>) -> Message {
        match server.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => Message::decode(text.as_bytes()).unwrap(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn test_forward_chain_is_legal() {
        use SessionState::*;
        assert!(GettingToken.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Disconnected));
    }

    #[test]
    fn test_illegal_transitions() {
        use SessionState::*;
        assert!(!Connected.can_transition_to(GettingToken));
        assert!(!GettingToken.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(GettingToken));
        assert!(!Disconnected.can_transition_to(Disconnected));
        // Aborts jump straight to Disconnected
        assert!(Connecting.can_transition_to(Disconnected));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::GettingToken.to_string(), "Getting Token");
        assert_eq!(SessionState::Disconnected.to_string(), "Disconnected");
    }

    #[test]
    fn test_set_state_publishes_and_refuses() {
        let session = session(1);
        let mut events = session.subscribe();

        assert!(!session.set_state(SessionState::Connected));
        assert!(session.set_state(SessionState::GettingToken));
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::StateChanged(SessionState::GettingToken)
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_request_summary() {
        let summary = RequestSummary::parse(
            b"POST /api/items?x=1 HTTP/1.1\r\nHost: abc.leap.test\r\nContent-Length: 2\r\n\r\n{}",
        )
        .unwrap();
        assert_eq!(summary.method, "POST");
        assert_eq!(summary.path, "/api/items?x=1");
        assert_eq!(summary.headers[0], ("Host".to_string(), "abc.leap.test".to_string()));
        assert!(RequestSummary::parse(b"\x00\x01 nonsense\r\n\r\n").is_none());
    }

    #[test]
    fn test_truncated_request_head_has_no_summary() {
        assert!(RequestSummary::parse(b"GET /partial HTTP/1.1\r\nHost: abc.leap.test\r\n").is_none());
        assert!(RequestSummary::parse(b"GE").is_none());
    }

    #[tokio::test]
    async fn test_second_run_is_refused() {
        let session = session(1);
        connected(&session);
        session.set_state(SessionState::Disconnected);
        let err = session.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ClientError::SessionFinished));
    }

    #[tokio::test]
    async fn test_relay_answers_from_local_service() {
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = local.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = local.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"HTTP/1.1 200 OK\r\n\r\nhi").await.unwrap();
        });

        let session = session(port);
        connected(&session);
        let mut events = session.subscribe();
        let (client, mut server) = channel_pair().await;
        let cancel = CancellationToken::new();

        let relay = {
            let cancel = cancel.clone();
            async move { session.relay(client, cancel).await }
        };
        let relay = tokio::spawn(relay);

        let request = Message::Request(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
        server.send(WsMessage::text(request.encode().unwrap())).await.unwrap();
        assert_eq!(
            next_reply(&mut server).await,
            Message::ResponseData(b"HTTP/1.1 200 OK\r\n\r\nhi".to_vec())
        );

        match events.recv().await.unwrap() {
            SessionEvent::Request(summary) => assert_eq!(summary.path, "/hello"),
            other => panic!("Unexpected event {:?}", other),
        }

        cancel.cancel();
        match server.next().await.unwrap().unwrap() {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
            other => panic!("Expected close frame, got {:?}", other),
        }
        // Drives the close reply back to the client
        while server.next().await.is_some() {}

        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_gives_up_on_silent_server() {
        let session = session(1);
        connected(&session);
        // The server end stays open but is never read, so no close reply comes back
        let (client, _server) = channel_pair().await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        session.relay(client, cancel).await.unwrap();
        let took = started.elapsed();

        let grace = session.config().disconnect_grace;
        assert!(took >= grace, "returned after {:?}, before the grace period", took);
        assert!(took < grace + Duration::from_secs(1), "returned after {:?}", took);
        assert_eq!(session.state(), Some(SessionState::Disconnected));
    }

    #[tokio::test]
    async fn test_unreachable_local_service_reports_unavailable() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let session = session(port);
        connected(&session);
        let (client, mut server) = channel_pair().await;
        let relay = tokio::spawn(async move { session.relay(client, CancellationToken::new()).await });

        let request = Message::Request(b"GET / HTTP/1.1\r\n\r\n".to_vec());
        server.send(WsMessage::text(request.encode().unwrap())).await.unwrap();
        assert_eq!(
            next_reply(&mut server).await,
            Message::ResponseError(ErrorCode::Unavailable)
        );

        // A going-away close from the server ends the session cleanly
        server
            .close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "closing".into(),
            }))
            .await
            .unwrap();
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_answers_internal() {
        let session = session(1);
        connected(&session);
        let (client, mut server) = channel_pair().await;
        let relay = tokio::spawn(async move { session.relay(client, CancellationToken::new()).await });

        server
            .send(WsMessage::text(r#"{"type":"request","data":"***"}"#))
            .await
            .unwrap();
        assert_eq!(
            next_reply(&mut server).await,
            Message::ResponseError(ErrorCode::Internal)
        );

        // Dropping the connection without a close frame is an abnormal end
        drop(server);
        let err = relay.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ChannelLost(_)));
    }
}
