//! LAN wire format.
//!
//! Every datagram is the ASCII [`MAGIC`] tag followed by a flat JSON object
//! whose values are all strings. Direct messages carry the whole clipboard
//! text; chunk fragments carry one base64 slice of it.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Constants
// ────────────────────────────────────────────────────────────────────────────

/// Magic bytes prepended to every datagram so unrelated broadcast traffic on
/// the same port is rejected before any parsing.
pub const MAGIC: &[u8; 6] = b"CLIPPY";

/// Value of the `app` field. Guards against collisions with other programs
/// that happen to use the same magic, not against malice.
pub const APP_IDENTIFIER: &str = "ClippySynch_v1.0";

/// UDP port used for both sending and listening.
pub const DEFAULT_PORT: u16 = 5555;

/// Largest payload a single IPv4 UDP datagram can carry
/// (65 535 - 8 byte UDP header - 20 byte IP header).
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Device names longer than this are truncated before they go on the wire.
pub const MAX_DEVICE_NAME_LEN: usize = 255;

/// Upper bound on everything in a fragment datagram except the base64 data:
/// magic, JSON punctuation, key names, app id, a maximal device name even
/// if every byte needs a six byte JSON escape, a UUID, indices and the
/// timestamp.
pub const ENVELOPE_OVERHEAD: usize = 2048;

/// Raw bytes per fragment. Also the largest content sent as a single
/// direct message, so sender and chunker share one threshold.
pub const DEFAULT_CHUNK_SIZE: usize = 30_000;

/// Smallest chunk size accepted from configuration.
pub const MIN_CHUNK_SIZE: usize = 512;

/// Length of the base64 (padded) encoding of `n` raw bytes.
pub const fn base64_len(n: usize) -> usize {
    n.div_ceil(3) * 4
}

/// Largest raw slice whose fragment datagram still fits [`MAX_UDP_PAYLOAD`].
pub const fn max_chunk_size() -> usize {
    (MAX_UDP_PAYLOAD - ENVELOPE_OVERHEAD) / 4 * 3
}

const _: () = assert!(DEFAULT_CHUNK_SIZE <= max_chunk_size());
const _: () = assert!(ENVELOPE_OVERHEAD + base64_len(max_chunk_size()) <= MAX_UDP_PAYLOAD);
const _: () = assert!(MIN_CHUNK_SIZE <= DEFAULT_CHUNK_SIZE);

// ────────────────────────────────────────────────────────────────────────────
// Message types
// ────────────────────────────────────────────────────────────────────────────

/// Operating system family reported by the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceKind {
    Windows,
    MacOS,
    Linux,
    #[default]
    Unknown,
}

impl DeviceKind {
    /// The kind of the machine this process runs on.
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            DeviceKind::Windows
        } else if cfg!(target_os = "macos") {
            DeviceKind::MacOS
        } else if cfg!(target_os = "linux") {
            DeviceKind::Linux
        } else {
            DeviceKind::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Windows => "Windows",
            DeviceKind::MacOS => "MacOS",
            DeviceKind::Linux => "Linux",
            DeviceKind::Unknown => "Unknown",
        }
    }

    /// Lenient parse: anything unrecognised is [`DeviceKind::Unknown`].
    pub fn parse(s: &str) -> Self {
        match s {
            "Windows" => DeviceKind::Windows,
            "MacOS" => DeviceKind::MacOS,
            "Linux" => DeviceKind::Linux,
            _ => DeviceKind::Unknown,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub app_id: String,
    pub device_name: String,
    pub device_kind: DeviceKind,
    /// Sender wall clock, milliseconds since the UNIX epoch.
    pub timestamp_ms: u64,
}

impl MessageHeader {
    /// Header for a message originating on this machine, stamped now.
    pub fn local(device_name: &str, device_kind: DeviceKind) -> Self {
        Self {
            app_id: APP_IDENTIFIER.to_string(),
            device_name: truncate_device_name(device_name),
            device_kind,
            timestamp_ms: now_unix_millis(),
        }
    }
}

/// One piece of a multi-datagram transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFragment {
    pub header: MessageHeader,
    pub message_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub payload_base64: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Direct {
        header: MessageHeader,
        content: String,
    },
    Fragment(ChunkFragment),
}

impl WireMessage {
    pub fn header(&self) -> &MessageHeader {
        match self {
            WireMessage::Direct { header, .. } => header,
            WireMessage::Fragment(fragment) => &fragment.header,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("datagram does not carry the protocol magic")]
    NotOurProtocol,
    #[error("datagram belongs to a different application")]
    ForeignApp,
    #[error("malformed payload: {0}")]
    Malformed(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Wire envelope
// ────────────────────────────────────────────────────────────────────────────

/// Flat key/value form of both variants. Every value is a string on the
/// wire; absent keys are simply not written.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    app: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_chunked: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_chunks: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
}

impl Envelope {
    fn with_header(header: &MessageHeader) -> Self {
        Envelope {
            app: Some(header.app_id.clone()),
            device_name: Some(header.device_name.clone()),
            device_type: Some(header.device_kind.as_str().to_string()),
            timestamp: Some(header.timestamp_ms.to_string()),
            ..Default::default()
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Wire helpers
// ────────────────────────────────────────────────────────────────────────────

/// Encode a [`WireMessage`] into a datagram with the magic prefix.
pub fn encode(message: &WireMessage) -> Vec<u8> {
    let envelope = match message {
        WireMessage::Direct { header, content } => Envelope {
            content: Some(content.clone()),
            ..Envelope::with_header(header)
        },
        WireMessage::Fragment(fragment) => Envelope {
            is_chunked: Some("true".to_string()),
            message_id: Some(fragment.message_id.clone()),
            chunk_index: Some(fragment.chunk_index.to_string()),
            total_chunks: Some(fragment.total_chunks.to_string()),
            chunk_data: Some(fragment.payload_base64.clone()),
            ..Envelope::with_header(&fragment.header)
        },
    };
    let json = serde_json::to_vec(&envelope).expect("envelope serialisation is infallible");
    let mut buf = Vec::with_capacity(MAGIC.len() + json.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&json);
    buf
}

/// Decode a raw datagram.
///
/// Checks run cheapest first: magic, JSON shape, application id, then the
/// variant's required fields.
pub fn decode(data: &[u8]) -> Result<WireMessage, FrameError> {
    if data.len() <= MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
        return Err(FrameError::NotOurProtocol);
    }

    let envelope: Envelope = serde_json::from_slice(&data[MAGIC.len()..])
        .map_err(|e| FrameError::Malformed(e.to_string()))?;

    let app_id = match envelope.app {
        Some(app) if app == APP_IDENTIFIER => app,
        _ => return Err(FrameError::ForeignApp),
    };

    let header = MessageHeader {
        app_id,
        device_name: required(envelope.device_name, "deviceName")?,
        device_kind: DeviceKind::parse(&required(envelope.device_type, "deviceType")?),
        timestamp_ms: parse_number(envelope.timestamp, "timestamp")?,
    };

    if envelope.is_chunked.as_deref() != Some("true") {
        return Ok(WireMessage::Direct {
            header,
            content: required(envelope.content, "content")?,
        });
    }

    let chunk_index: u32 = parse_number(envelope.chunk_index, "chunkIndex")?;
    let total_chunks: u32 = parse_number(envelope.total_chunks, "totalChunks")?;
    if total_chunks == 0 || chunk_index >= total_chunks {
        return Err(FrameError::Malformed(format!(
            "chunk index {} out of range for {} chunks",
            chunk_index, total_chunks
        )));
    }

    Ok(WireMessage::Fragment(ChunkFragment {
        header,
        message_id: required(envelope.message_id, "messageId")?,
        chunk_index,
        total_chunks,
        payload_base64: required(envelope.chunk_data, "chunkData")?,
    }))
}

fn required(value: Option<String>, key: &str) -> Result<String, FrameError> {
    value.ok_or_else(|| FrameError::Malformed(format!("missing `{}`", key)))
}

fn parse_number<T: std::str::FromStr>(value: Option<String>, key: &str) -> Result<T, FrameError> {
    required(value, key)?
        .parse()
        .map_err(|_| FrameError::Malformed(format!("`{}` is not a number", key)))
}

/// Truncate on a character boundary to at most [`MAX_DEVICE_NAME_LEN`] bytes.
pub fn truncate_device_name(name: &str) -> String {
    if name.len() <= MAX_DEVICE_NAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_DEVICE_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Returns the current UNIX timestamp in milliseconds.
pub fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> MessageHeader {
        MessageHeader {
            app_id: APP_IDENTIFIER.to_string(),
            device_name: "desk".to_string(),
            device_kind: DeviceKind::Linux,
            timestamp_ms: 1_700_000_000_000,
        }
    }

    fn raw(json: &str) -> Vec<u8> {
        let mut buf = MAGIC.to_vec();
        buf.extend_from_slice(json.as_bytes());
        buf
    }

    #[test]
    fn direct_message_survives_encoding() {
        let msg = WireMessage::Direct {
            header: header(),
            content: "hello \"world\"\n\u{00e9}\u{1F600}".to_string(),
        };
        let bytes = encode(&msg);
        assert!(bytes.starts_with(MAGIC));
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn fragment_survives_encoding() {
        let msg = WireMessage::Fragment(ChunkFragment {
            header: header(),
            message_id: "0b8a6c1e".to_string(),
            chunk_index: 2,
            total_chunks: 3,
            payload_base64: "aGVsbG8=".to_string(),
        });
        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn direct_payload_uses_canonical_keys() {
        let bytes = encode(&WireMessage::Direct {
            header: header(),
            content: "x".to_string(),
        });
        let value: serde_json::Value = serde_json::from_slice(&bytes[MAGIC.len()..]).unwrap();
        let obj = value.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["app", "content", "deviceName", "deviceType", "timestamp"]);
        assert!(obj.values().all(|v| v.is_string()));
    }

    #[test]
    fn rejects_datagrams_without_magic() {
        assert_eq!(decode(b""), Err(FrameError::NotOurProtocol));
        assert_eq!(decode(b"CLIPPY"), Err(FrameError::NotOurProtocol));
        assert_eq!(decode(b"CLIPPX{}"), Err(FrameError::NotOurProtocol));
        assert_eq!(decode(b"hello world"), Err(FrameError::NotOurProtocol));
    }

    #[test]
    fn rejects_foreign_application() {
        let other = raw(
            r#"{"app":"SomethingElse","content":"x","deviceName":"a","deviceType":"Linux","timestamp":"1"}"#,
        );
        assert_eq!(decode(&other), Err(FrameError::ForeignApp));

        let missing = raw(
            r#"{"content":"x","deviceName":"a","deviceType":"Linux","timestamp":"1"}"#,
        );
        assert_eq!(decode(&missing), Err(FrameError::ForeignApp));
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(decode(&raw("not json")), Err(FrameError::Malformed(_))));

        let no_content = raw(
            r#"{"app":"ClippySynch_v1.0","deviceName":"a","deviceType":"Linux","timestamp":"1"}"#,
        );
        assert!(matches!(decode(&no_content), Err(FrameError::Malformed(_))));

        let bad_ts = raw(
            r#"{"app":"ClippySynch_v1.0","content":"x","deviceName":"a","deviceType":"Linux","timestamp":"soon"}"#,
        );
        assert!(matches!(decode(&bad_ts), Err(FrameError::Malformed(_))));

        let out_of_range = raw(
            r#"{"app":"ClippySynch_v1.0","deviceName":"a","deviceType":"Linux","timestamp":"1","isChunked":"true","messageId":"m","chunkIndex":"3","totalChunks":"3","chunkData":""}"#,
        );
        assert!(matches!(decode(&out_of_range), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn explicit_non_chunked_flag_is_direct() {
        let legacy = raw(
            r#"{"app":"ClippySynch_v1.0","content":"hi","deviceName":"a","deviceType":"Plan9","timestamp":"5","isChunked":"false"}"#,
        );
        match decode(&legacy).unwrap() {
            WireMessage::Direct { header, content } => {
                assert_eq!(content, "hi");
                assert_eq!(header.device_kind, DeviceKind::Unknown);
                assert_eq!(header.timestamp_ms, 5);
            }
            other => panic!("expected direct message, got {:?}", other),
        }
    }

    #[test]
    fn long_device_names_are_truncated_on_char_boundary() {
        let name = "\u{00e9}".repeat(200);
        let header = MessageHeader::local(&name, DeviceKind::Linux);
        assert!(header.device_name.len() <= MAX_DEVICE_NAME_LEN);
        assert!(header.device_name.chars().all(|c| c == '\u{00e9}'));
    }

    #[test]
    fn max_fragment_fits_in_one_datagram() {
        let name = "\u{0001}".repeat(MAX_DEVICE_NAME_LEN);
        let payload = "A".repeat(base64_len(max_chunk_size()));
        let msg = WireMessage::Fragment(ChunkFragment {
            header: MessageHeader {
                app_id: APP_IDENTIFIER.to_string(),
                device_name: name,
                device_kind: DeviceKind::Windows,
                timestamp_ms: u64::MAX,
            },
            message_id: uuid::Uuid::new_v4().to_string(),
            chunk_index: u32::MAX - 1,
            total_chunks: u32::MAX,
            payload_base64: payload,
        });
        assert!(encode(&msg).len() <= MAX_UDP_PAYLOAD);
    }
}
