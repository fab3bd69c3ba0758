//! Tunnel channel: WebSocket handshake and the per-tunnel reader/writer

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use leap_protocol::{Message, ProtocolError};

use crate::tunnel::{Delivery, Outbound, Reply, Tunnel};

/// Frames buffered for the writer before dispatches start waiting
const OUTBOUND_CAPACITY: usize = 16;

/// How long the writer gets to flush the closing handshake
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Client sent a request message")]
    UnexpectedRequest,
}

/// Check the WebSocket upgrade headers and compute `Sec-WebSocket-Accept`
pub fn accept_key(headers: &HeaderMap) -> Option<String> {
    let is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let version_ok = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .is_some_and(|v| v.as_bytes() == b"13");
    let key = headers.get(header::SEC_WEBSOCKET_KEY)?;

    (is_websocket && version_ok).then(|| derive_accept_key(key.as_bytes()))
}

/// 101 response completing the server side of the handshake
pub fn switching_protocols(accept: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    if let Ok(value) = HeaderValue::from_str(accept) {
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, value);
    }
    response
}

/// Apply one inbound frame to the tunnel
///
/// An error means the channel can no longer be trusted and must close.
pub fn handle_frame(tunnel: &Tunnel, data: &[u8]) -> Result<(), FrameError> {
    let reply = match Message::decode(data)? {
        Message::ResponseData(raw) => Reply::Data(raw),
        Message::ResponseError(code) => Reply::Error(code),
        Message::Request(_) => return Err(FrameError::UnexpectedRequest),
    };

    match tunnel.deliver(reply) {
        Delivery::Delivered => {}
        Delivery::Discarded => {
            tracing::debug!("Dropped late reply on {}", tunnel.subdomain());
        }
        Delivery::Unsolicited => {
            tracing::warn!("Unsolicited reply on {}", tunnel.subdomain());
        }
    }
    Ok(())
}

fn close_frame(going_away: bool) -> WsMessage {
    let code = if going_away {
        CloseCode::Away
    } else {
        CloseCode::Normal
    };
    WsMessage::Close(Some(CloseFrame {
        code,
        reason: "closing".into(),
    }))
}

/// Serve an established channel until it closes
///
/// The tunnel is attached for the duration of the call and detached before
/// it returns, which fails any dispatch still waiting for a reply.
pub async fn run_channel<S>(tunnel: Arc<Tunnel>, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
    tunnel.attach(tx);

    let subdomain = tunnel.subdomain().to_string();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let (frame, closing) = match outbound {
                Outbound::Message(text) => (WsMessage::text(text), false),
                Outbound::Close { going_away } => (close_frame(going_away), true),
            };
            if let Err(e) = sink.send(frame).await {
                tracing::debug!("Channel write failed on {}: {}", subdomain, e);
                return;
            }
            if closing {
                break;
            }
        }
        // Flushes a pending close reply, or starts the closing handshake
        let _ = sink.close().await;
    });

    while let Some(frame) = stream.next().await {
        let result = match frame {
            Ok(WsMessage::Text(text)) => handle_frame(&tunnel, text.as_bytes()),
            Ok(WsMessage::Binary(data)) => handle_frame(&tunnel, &data),
            Ok(WsMessage::Close(frame)) => {
                match frame.as_ref().map(|f| f.code) {
                    Some(CloseCode::Normal) | Some(CloseCode::Away) | None => {
                        tracing::debug!("Client {} closed the channel", tunnel.subdomain());
                    }
                    Some(code) => {
                        tracing::warn!("Client {} closed the channel: {}", tunnel.subdomain(), code);
                    }
                }
                break;
            }
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!("Channel read failed on {}: {}", tunnel.subdomain(), e);
                break;
            }
        };

        if let Err(e) = result {
            tracing::warn!("Closing channel for {}: {}", tunnel.subdomain(), e);
            break;
        }
    }

    tunnel.detach();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        tracing::debug!("Channel writer for {} did not finish", tunnel.subdomain());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leap_protocol::ErrorCode;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn channel_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    #[test]
    fn test_accept_key_rfc_sample() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        assert_eq!(
            accept_key(&headers).as_deref(),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }

    #[test]
    fn test_accept_key_requires_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("abc"));
        assert!(accept_key(&headers).is_none());
    }

    #[test]
    fn test_inbound_request_is_rejected() {
        let tunnel = Tunnel::new("abc");
        let frame = Message::Request(b"GET /".to_vec()).encode().unwrap();
        assert!(matches!(
            handle_frame(&tunnel, frame.as_bytes()),
            Err(FrameError::UnexpectedRequest)
        ));
    }

    #[test]
    fn test_malformed_frame_is_rejected() {
        let tunnel = Tunnel::new("abc");
        assert!(matches!(
            handle_frame(&tunnel, br#"{"type":"bogus"}"#),
            Err(FrameError::Protocol(ProtocolError::UnknownType(_)))
        ));
    }

    #[tokio::test]
    async fn test_channel_relays_request_and_reply() {
        let (server, mut client) = channel_pair().await;
        let tunnel = Arc::new(Tunnel::new("abc"));
        let serving = tokio::spawn(run_channel(tunnel.clone(), server));

        while !tunnel.is_connected() {
            tokio::task::yield_now().await;
        }

        let caller = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.dispatch(b"GET / HTTP/1.1\r\n\r\n".to_vec(), None).await })
        };

        let frame = client.next().await.unwrap().unwrap();
        let request = Message::decode(frame.to_text().unwrap().as_bytes()).unwrap();
        assert_eq!(request, Message::Request(b"GET / HTTP/1.1\r\n\r\n".to_vec()));

        let reply = Message::ResponseError(ErrorCode::Timeout).encode().unwrap();
        client.send(WsMessage::text(reply)).await.unwrap();
        assert_eq!(caller.await.unwrap().unwrap(), Reply::Error(ErrorCode::Timeout));

        client.close(None).await.unwrap();
        serving.await.unwrap();
        assert!(!tunnel.is_connected());
    }

    #[tokio::test]
    async fn test_going_away_close_reaches_client() {
        let (server, mut client) = channel_pair().await;
        let tunnel = Arc::new(Tunnel::new("abc"));
        let serving = tokio::spawn(run_channel(tunnel.clone(), server));

        while !tunnel.is_connected() {
            tokio::task::yield_now().await;
        }
        assert!(tunnel.close(true).await);

        match client.next().await.unwrap().unwrap() {
            WsMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("Expected close frame, got {:?}", other),
        }
        // Drives the close reply back to the server
        while client.next().await.is_some() {}

        serving.await.unwrap();
        assert!(!tunnel.is_connected());
    }
}
