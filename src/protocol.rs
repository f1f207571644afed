//! Wire protocol shared by the winmux daemon and its clients.
//!
//! Wire format: `[length: u32 little-endian][payload: bytes]`
//!
//! Payloads are UTF-8 JSON records with a `type` discriminator and
//! lower-camel-case field names. Optional fields are omitted when absent;
//! unknown fields are ignored on read. Binary data travels base64-encoded.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size (64 MiB). Prevents OOM on malformed data.
pub const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame payload too large: {0} bytes")]
    InvalidFrame(u32),

    #[error("truncated frame")]
    Truncated,

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read into `buf` until it is full or the stream ends.
///
/// Returns the number of bytes actually read; anything short of
/// `buf.len()` means end-of-stream was observed.
async fn fill_exact<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Serialize `msg`, prefix it with the 4-byte little-endian length, write
/// both, and flush.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg).map_err(FrameError::Encode)?;
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame payload from the stream.
///
/// Returns `Ok(None)` on a clean disconnect (end-of-stream before any
/// header byte). A short read after at least one header byte, or a short
/// payload read, is a fatal framing error. A declared length above the
/// 64 MiB cap (which also covers any negative value reinterpreted as
/// unsigned) fails with `InvalidFrame`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let n = fill_exact(reader, &mut header).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < header.len() {
        return Err(FrameError::Truncated);
    }

    let length = u32::from_le_bytes(header);
    if length > MAX_PAYLOAD {
        return Err(FrameError::InvalidFrame(length));
    }

    let mut payload = vec![0u8; length as usize];
    let n = fill_exact(reader, &mut payload).await?;
    if n < payload.len() {
        return Err(FrameError::Truncated);
    }

    Ok(Some(Bytes::from(payload)))
}

// ── Message types ──────────────────────────────────────────────────

/// Client → Server requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Ping,
    List,
    #[serde(rename_all = "camelCase")]
    CreateSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    #[serde(rename_all = "camelCase")]
    Attach { id_or_name: String },
    #[serde(rename_all = "camelCase")]
    Input {
        session_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename_all = "camelCase")]
    Kill { session_id: String },
    #[serde(rename_all = "camelCase")]
    Detach { session_id: String },
}

/// Server → Client events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    Pong { server_time: DateTime<Utc> },
    Sessions { sessions: Vec<SessionSummary> },
    #[serde(rename_all = "camelCase")]
    Created { session_id: String },
    #[serde(rename_all = "camelCase")]
    Attached { session_id: String },
    #[serde(rename_all = "camelCase")]
    Output {
        session_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Exit { session_id: String, code: u32 },
    #[serde(rename_all = "camelCase")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
        code: String,
        message: String,
    },
}

/// Flat snapshot of a session's externally visible fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub state: SessionState,
    pub cols: u16,
    pub rows: u16,
    pub shell: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Running,
    Exited,
}

/// Request `type` values this daemon understands.
const KNOWN_REQUESTS: &[&str] = &[
    "Ping",
    "List",
    "CreateSession",
    "Attach",
    "Input",
    "Resize",
    "Kill",
    "Detach",
];

#[derive(Error, Debug)]
pub enum DecodeError {
    /// The payload is valid JSON with a `type` discriminator this server
    /// does not implement. Per-request error, not fatal to the connection.
    #[error("unknown request type: {0}")]
    UnknownType(String),

    /// The payload is not a decodable request. Fatal to the connection.
    #[error("undecodable payload: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Decode a request payload, distinguishing an unknown `type`
/// discriminator from a structurally broken payload.
pub fn decode_request(payload: &[u8]) -> Result<Request, DecodeError> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(DecodeError::Malformed)?;
    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_owned);
    match serde_json::from_value::<Request>(value) {
        Ok(request) => Ok(request),
        Err(err) => match tag {
            Some(tag) if !KNOWN_REQUESTS.contains(&tag.as_str()) => {
                Err(DecodeError::UnknownType(tag))
            }
            _ => Err(DecodeError::Malformed(err)),
        },
    }
}

/// Decode an event payload (client side).
pub fn decode_event(payload: &[u8]) -> Result<Event, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Serde helper for base64-encoded byte vectors in JSON.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn round_trip_request(req: &Request) -> Request {
        let mut buf = Vec::new();
        write_frame(&mut buf, req).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let payload = read_frame(&mut cursor).await.unwrap().unwrap();
        decode_request(&payload).unwrap()
    }

    async fn round_trip_event(ev: &Event) -> Event {
        let mut buf = Vec::new();
        write_frame(&mut buf, ev).await.unwrap();
        let mut cursor = Cursor::new(buf);
        let payload = read_frame(&mut cursor).await.unwrap().unwrap();
        decode_event(&payload).unwrap()
    }

    #[tokio::test]
    async fn request_variants_round_trip() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let requests = vec![
            Request::Ping,
            Request::List,
            Request::CreateSession {
                name: Some("mysession".into()),
                shell: Some("pwsh".into()),
                cwd: Some("C:\\".into()),
                env: Some(env),
                cols: Some(100),
                rows: Some(30),
            },
            Request::CreateSession {
                name: None,
                shell: None,
                cwd: None,
                env: None,
                cols: None,
                rows: None,
            },
            Request::Attach {
                id_or_name: "mysession".into(),
            },
            Request::Input {
                session_id: "abc123".into(),
                data: b"echo hi\r\n".to_vec(),
            },
            Request::Resize {
                session_id: "abc123".into(),
                cols: 120,
                rows: 40,
            },
            Request::Kill {
                session_id: "abc123".into(),
            },
            Request::Detach {
                session_id: "abc123".into(),
            },
        ];
        for req in requests {
            let decoded = round_trip_request(&req).await;
            assert_eq!(decoded, req);
        }
    }

    #[tokio::test]
    async fn event_variants_round_trip() {
        let now = Utc::now();
        let events = vec![
            Event::Pong { server_time: now },
            Event::Sessions { sessions: vec![] },
            Event::Sessions {
                sessions: vec![SessionSummary {
                    id: "a".repeat(32),
                    name: "mysession".into(),
                    state: SessionState::Running,
                    cols: 100,
                    rows: 30,
                    shell: "pwsh".into(),
                    cwd: "C:\\".into(),
                    pid: Some(4242),
                    created_at: now,
                    last_active_at: now,
                }],
            },
            Event::Created {
                session_id: "abc".into(),
            },
            Event::Attached {
                session_id: "abc".into(),
            },
            Event::Output {
                session_id: "abc".into(),
                data: b"hello\x1b[0m".to_vec(),
            },
            Event::Exit {
                session_id: "abc".into(),
                code: 0,
            },
            Event::Ack { req_id: None },
            Event::Error {
                req_id: None,
                code: "NOT_FOUND".into(),
                message: "Session not found".into(),
            },
        ];
        for ev in events {
            let decoded = round_trip_event(&ev).await;
            assert_eq!(decoded, ev);
        }
    }

    #[tokio::test]
    async fn large_binary_payload_round_trips() {
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let ev = Event::Output {
            session_id: "abc".into(),
            data: data.clone(),
        };
        let decoded = round_trip_event(&ev).await;
        match decoded {
            Event::Output { data: got, .. } => assert_eq!(got, data),
            other => panic!("expected Output, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_stream_is_clean_end() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn partial_header_is_fatal() {
        let mut cursor = Cursor::new(vec![0x05u8, 0x00]);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }

    #[tokio::test]
    async fn oversize_length_is_invalid_frame() {
        let length = MAX_PAYLOAD + 1;
        let mut cursor = Cursor::new(length.to_le_bytes().to_vec());
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidFrame(l) if l == length));
    }

    #[tokio::test]
    async fn negative_length_is_invalid_frame() {
        // -1 as a little-endian i32 reads back as u32::MAX
        let mut cursor = Cursor::new((-1i32).to_le_bytes().to_vec());
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidFrame(_)));
    }

    #[tokio::test]
    async fn truncated_payload_is_fatal() {
        let mut buf = 10u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }

    #[tokio::test]
    async fn multiple_frames_sequential() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::Ping).await.unwrap();
        write_frame(&mut buf, &Request::List).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let first = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decode_request(&first).unwrap(), Request::Ping);
        let second = read_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(decode_request(&second).unwrap(), Request::List);
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[test]
    fn unknown_type_is_distinguished() {
        let err = decode_request(br#"{"type":"Rename","sessionId":"x"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(ref t) if t == "Rename"));
    }

    #[test]
    fn malformed_json_is_fatal() {
        let err = decode_request(b"{not json").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn known_type_with_bad_fields_is_malformed() {
        let err = decode_request(br#"{"type":"Resize","sessionId":"x"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let req = decode_request(br#"{"type":"Attach","idOrName":"foo","extra":42}"#).unwrap();
        assert_eq!(
            req,
            Request::Attach {
                id_or_name: "foo".into()
            }
        );
    }

    #[test]
    fn absent_optional_fields_are_omitted() {
        let ev = Event::Error {
            req_id: None,
            code: "NOT_FOUND".into(),
            message: "Session not found".into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("reqId"), "null field serialized: {json}");

        let req = Request::CreateSession {
            name: Some("s".into()),
            shell: None,
            cwd: None,
            env: None,
            cols: None,
            rows: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("shell"), "absent field serialized: {json}");
        assert!(json.contains(r#""type":"CreateSession""#));
    }

    #[test]
    fn binary_data_is_base64_on_the_wire() {
        let req = Request::Input {
            session_id: "abc".into(),
            data: b"echo hi\r\n".to_vec(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let data = value["data"].as_str().unwrap();
        use base64::Engine;
        assert_eq!(
            base64::engine::general_purpose::STANDARD
                .decode(data)
                .unwrap(),
            b"echo hi\r\n"
        );
    }

    #[test]
    fn session_state_wire_form() {
        assert_eq!(
            serde_json::to_string(&SessionState::Running).unwrap(),
            r#""Running""#
        );
        assert_eq!(
            serde_json::to_string(&SessionState::Exited).unwrap(),
            r#""Exited""#
        );
    }
}
