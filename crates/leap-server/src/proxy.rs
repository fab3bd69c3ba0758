use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};

use leap_protocol::ErrorCode;

/// Serialize a public request into the raw bytes relayed to the client
///
/// The request line keeps the original method, path and version. `Host`
/// comes first, `Connection: close` replaces whatever the caller sent so the
/// local service ends the response by closing. A collected body is always
/// sent with an explicit `Content-Length`.
pub fn serialize_request(parts: &Parts, body: &[u8]) -> Vec<u8> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(format!("{} {} {:?}\r\n", parts.method, path, parts.version).as_bytes());

    if let Some(host) = parts.headers.get(header::HOST) {
        write_header(&mut out, "Host", host);
    }

    for (name, value) in parts.headers.iter() {
        if name == header::HOST
            || name == header::CONNECTION
            || name == header::TRANSFER_ENCODING
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        write_header(&mut out, name.as_str(), value);
    }

    if !body.is_empty() {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body);
    out
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &HeaderValue) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// Public status for an error code reported by the client
pub fn error_status(code: ErrorCode) -> (StatusCode, &'static str) {
    match code {
        ErrorCode::Unavailable => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Failed to connect to local service",
        ),
        ErrorCode::Timeout => (
            StatusCode::GATEWAY_TIMEOUT,
            "The local service took too long to respond",
        ),
        ErrorCode::Internal => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "An internal error occurred while proxying the request",
        ),
    }
}

/// Plain-text response; closes the connection
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONNECTION, "close")
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
        .unwrap()
}

/// JSON response with an already serialized body; closes the connection
pub fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONNECTION, "close")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

/// Placeholder handed to hyper once the raw relayed bytes own the connection
pub fn taken_over_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONNECTION, "close")
        .body(Full::new(Bytes::new()))
        .unwrap()
}
