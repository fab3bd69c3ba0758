use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Reason the relay client could not produce a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ErrorCode {
    /// The local service refused or never accepted the connection
    Unavailable,
    /// The local service did not answer before the forwarding deadline
    Timeout,
    /// Decoding or unexpected local I/O failure
    Internal,
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Unavailable => 0,
            ErrorCode::Timeout => 1,
            ErrorCode::Internal => 2,
        }
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorCode::Unavailable),
            1 => Ok(ErrorCode::Timeout),
            2 => Ok(ErrorCode::Internal),
            other => Err(ProtocolError::UnknownErrorCode(other)),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCode::Unavailable => f.write_str("unavailable"),
            ErrorCode::Timeout => f.write_str("timeout"),
            ErrorCode::Internal => f.write_str("internal"),
        }
    }
}

/// A message exchanged over a tunnel channel
///
/// Payloads are raw bytes (a serialized HTTP request or response). On the
/// wire they are base64 strings inside a JSON object whose `type` field
/// selects the variant:
///
/// ```text
/// {"type":"request","data":"<base64>"}
/// {"type":"response_data","response":"<base64>"}
/// {"type":"response_error","code":0|1|2}
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Server -> client: a full serialized HTTP request
    Request(Vec<u8>),
    /// Client -> server: the raw bytes the local service answered with
    ResponseData(Vec<u8>),
    /// Client -> server: the request could not be forwarded
    ResponseError(ErrorCode),
}

const REQUEST: &str = "request";
const RESPONSE_DATA: &str = "response_data";
const RESPONSE_ERROR: &str = "response_error";

/// Only the tag, so unknown types are reported before the body is parsed
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Request { data: String },
    ResponseData { response: String },
    ResponseError { code: ErrorCode },
}

impl Message {
    /// Wire name of this message's type tag
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request(_) => REQUEST,
            Message::ResponseData(_) => RESPONSE_DATA,
            Message::ResponseError(_) => RESPONSE_ERROR,
        }
    }

    /// Encode to the JSON text carried by one channel frame
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let wire = match self {
            Message::Request(data) => WireMessage::Request {
                data: STANDARD.encode(data),
            },
            Message::ResponseData(response) => WireMessage::ResponseData {
                response: STANDARD.encode(response),
            },
            Message::ResponseError(code) => WireMessage::ResponseError { code: *code },
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Decode one channel frame
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(frame)?;
        match envelope.kind.as_str() {
            REQUEST | RESPONSE_DATA | RESPONSE_ERROR => {}
            _ => return Err(ProtocolError::UnknownType(envelope.kind)),
        }

        let message = match serde_json::from_slice(frame)? {
            WireMessage::Request { data } => Message::Request(decode_payload(REQUEST, &data)?),
            WireMessage::ResponseData { response } => {
                Message::ResponseData(decode_payload(RESPONSE_DATA, &response)?)
            }
            WireMessage::ResponseError { code } => Message::ResponseError(code),
        };
        Ok(message)
    }
}

fn decode_payload(kind: &'static str, encoded: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(encoded)
        .map_err(|source| ProtocolError::Payload { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let json = Message::Request(b"GET / HTTP/1.1\r\n\r\n".to_vec())
            .encode()
            .unwrap();
        assert!(json.starts_with(r#"{"type":"request","data":""#));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["data"], "R0VUIC8gSFRUUC8xLjENCg0K");
    }

    #[test]
    fn test_response_error_code_is_integer() {
        let json = Message::ResponseError(ErrorCode::Timeout).encode().unwrap();
        assert_eq!(json, r#"{"type":"response_error","code":1}"#);

        let decoded = Message::decode(br#"{"type":"response_error","code":2}"#).unwrap();
        assert_eq!(decoded, Message::ResponseError(ErrorCode::Internal));
    }

    #[test]
    fn test_binary_payload_survives() {
        let payload: Vec<u8> = vec![0x00, 0xff, 0xfe, 0x80, 0x00, b'\r', b'\n', 0xc3];
        let json = Message::Request(payload.clone()).encode().unwrap();

        match Message::decode(json.as_bytes()).unwrap() {
            Message::Request(data) => assert_eq!(data, payload),
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_response_data_decodes_padded_payload() {
        let frame = br#"{"type":"response_data","response":"SFRUUC8xLjEgMjAwIE9LDQoNCg=="}"#;
        assert_eq!(
            Message::decode(frame).unwrap(),
            Message::ResponseData(b"HTTP/1.1 200 OK\r\n\r\n".to_vec())
        );
    }

    #[test]
    fn test_empty_response_data() {
        let decoded = Message::decode(br#"{"type":"response_data","response":""}"#).unwrap();
        assert_eq!(decoded, Message::ResponseData(Vec::new()));
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let err = Message::decode(br#"{"type":"ping","data":"AA=="}"#).unwrap_err();
        match err {
            ProtocolError::UnknownType(kind) => assert_eq!(kind, "ping"),
            other => panic!("Wrong error: {:?}", other),
        }
    }

    #[test]
    fn test_bad_base64_names_the_message_kind() {
        let err = Message::decode(br#"{"type":"request","data":"not base64!"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Payload { kind: "request", .. }));
    }

    #[test]
    fn test_out_of_range_error_code_rejected() {
        assert!(Message::decode(br#"{"type":"response_error","code":7}"#).is_err());
    }

    #[test]
    fn test_missing_type_is_json_error() {
        let err = Message::decode(br#"{"data":"AA=="}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
