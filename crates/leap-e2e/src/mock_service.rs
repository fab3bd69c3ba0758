//! Local services for E2E tests
//!
//! These play the part of the service a tunnel client exposes. The client
//! opens one connection per relayed request and reads until the service
//! closes it.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A recorded HTTP request for test assertions
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Request URI path
    pub uri: String,
    /// Request headers, names lowercased
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// First value of header `name`
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A mock HTTP service for testing
///
/// Records every request it serves. Responses can be configured via the
/// `set_response_*` methods.
pub struct MockHttpService {
    addr: SocketAddr,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    response_status: Arc<RwLock<StatusCode>>,
    response_body: Arc<RwLock<Vec<u8>>>,
    response_headers: Arc<RwLock<Vec<(String, String)>>>,
    /// Time spent before answering each request
    delay: Arc<RwLock<Duration>>,
    in_flight: Arc<InFlight>,
}

impl MockHttpService {
    /// Start a mock HTTP service on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let service = Self {
            addr,
            requests: Arc::new(RwLock::new(Vec::new())),
            response_status: Arc::new(RwLock::new(StatusCode::OK)),
            response_body: Arc::new(RwLock::new(b"OK".to_vec())),
            response_headers: Arc::new(RwLock::new(vec![])),
            delay: Arc::new(RwLock::new(Duration::ZERO)),
            in_flight: Arc::new(InFlight::default()),
        };

        let requests = service.requests.clone();
        let status = service.response_status.clone();
        let body = service.response_body.clone();
        let headers = service.response_headers.clone();
        let delay = service.delay.clone();
        let in_flight = service.in_flight.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };

                let requests = requests.clone();
                let status = status.clone();
                let body = body.clone();
                let headers = headers.clone();
                let delay = delay.clone();
                let in_flight = in_flight.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        let status = status.clone();
                        let body = body.clone();
                        let headers = headers.clone();
                        let delay = delay.clone();
                        let in_flight = in_flight.clone();
                        async move {
                            in_flight.enter();

                            let method = req.method().to_string();
                            let uri = req.uri().to_string();
                            let req_headers: Vec<(String, String)> = req
                                .headers()
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                                .collect();

                            let req_body = req
                                .into_body()
                                .collect()
                                .await
                                .map(|b| b.to_bytes().to_vec())
                                .unwrap_or_default();

                            requests.write().push(RecordedRequest {
                                method,
                                uri,
                                headers: req_headers,
                                body: req_body,
                            });

                            let pause = *delay.read();
                            if !pause.is_zero() {
                                tokio::time::sleep(pause).await;
                            }

                            let mut builder = Response::builder().status(*status.read());
                            for (name, value) in headers.read().iter() {
                                builder = builder.header(name, value);
                            }
                            let response = builder
                                .body(Full::new(Bytes::from(body.read().clone())))
                                .unwrap();

                            in_flight.leave();
                            Ok::<_, Infallible>(response)
                        }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        service
    }

    /// Get the address this service is listening on
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the port this service is listening on
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Get all recorded requests
    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }

    /// Get the last recorded request (if any)
    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.read().last().cloned()
    }

    /// Highest number of requests that were being served at once
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max.load(Ordering::SeqCst)
    }

    /// Set the response status code
    pub fn set_response_status(&self, status: StatusCode) {
        *self.response_status.write() = status;
    }

    /// Set the response body
    pub fn set_response_body(&self, body: impl Into<Vec<u8>>) {
        *self.response_body.write() = body.into();
    }

    /// Add a single response header
    pub fn add_response_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers
            .write()
            .push((name.into(), value.into()));
    }

    /// Wait this long before answering each request
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.write() = delay;
    }
}

/// A service that answers every connection with fixed bytes and closes
///
/// Lets tests check that responses are relayed byte for byte, including
/// responses no HTTP library would produce.
pub struct RawService {
    addr: SocketAddr,
}

impl RawService {
    pub async fn start(response: impl Into<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind raw service");
        let addr = listener.local_addr().unwrap();
        let response = Arc::new(response.into());

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let response = response.clone();
                tokio::spawn(async move {
                    // Consume the request head first
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = stream.write_all(&response).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { addr }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

/// A service that accepts connections and never answers
pub struct SilentService {
    addr: SocketAddr,
}

impl SilentService {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind silent service");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        Self { addr }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_service_basic() {
        let service = MockHttpService::start().await;
        service.set_response_body(b"Hello, World!".to_vec());

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("http://{}/test", service.addr()))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "Hello, World!");

        let requests = service.get_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].uri, "/test");
        assert_eq!(service.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_raw_service_writes_fixed_bytes() {
        let service = RawService::start(b"not http at all".to_vec()).await;

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", service.port()))
            .await
            .unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"not http at all");
    }
}
