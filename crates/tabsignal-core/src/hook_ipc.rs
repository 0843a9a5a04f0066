use crate::{HookEvent, PollerHandle, TabState};
use chrono::Utc;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

// Either a number or a numeric string on the wire.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawVersion {
    Number(u16),
    Text(String),
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawVersion::deserialize(deserializer)? {
            RawVersion::Number(version) => Ok(ProtocolVersion(version)),
            RawVersion::Text(text) => text.trim().parse::<u16>().map(ProtocolVersion).map_err(
                |err| de::Error::custom(format!("invalid protocol version '{text}': {err}")),
            ),
        }
    }
}

/// One NDJSON line exchanged between a hook client and the hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HookEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: HookMsg,
}

impl HookEnvelope {
    pub fn new(sender_id: &str, request_id: Option<String>, msg: HookMsg) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            sender_id: sender_id.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            request_id,
            msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum HookMsg {
    Signal(SignalPayload),
    Clear(ClearPayload),
    Status(StatusRequest),
    Ack(AckPayload),
    StatusReport(StatusReport),
    Error(ErrorPayload),
}

impl HookMsg {
    pub fn kind(&self) -> &'static str {
        match self {
            HookMsg::Signal(_) => "signal",
            HookMsg::Clear(_) => "clear",
            HookMsg::Status(_) => "status",
            HookMsg::Ack(_) => "ack",
            HookMsg::StatusReport(_) => "status_report",
            HookMsg::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalPayload {
    pub instance_id: String,
    pub window_id: u64,
    pub event: HookEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClearPayload {
    pub instance_id: String,
    pub window_id: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusRequest {
    #[serde(default)]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckPayload {
    pub accepted: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusReport {
    #[serde(default)]
    pub records: Vec<TabState>,
    #[serde(default)]
    pub pollers: Vec<PollerHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PollerPhase, TabColor};

    fn signal_envelope() -> HookEnvelope {
        HookEnvelope {
            version: ProtocolVersion::CURRENT,
            sender_id: "hook-4242".to_string(),
            timestamp: "2026-03-01T10:00:00Z".to_string(),
            request_id: Some("req-1".to_string()),
            msg: HookMsg::Signal(SignalPayload {
                instance_id: "unix:@mykitty-4242".to_string(),
                window_id: 7,
                event: HookEvent::Stop,
            }),
        }
    }

    #[test]
    fn signal_and_status_report_survive_the_wire() {
        let report = HookEnvelope {
            sender_id: "tabsignal-hub".to_string(),
            msg: HookMsg::StatusReport(StatusReport {
                records: vec![TabState {
                    instance_id: "unix:@mykitty-4242".to_string(),
                    tab_id: 2,
                    color: TabColor::BluePaused,
                    painted: true,
                    updated_at_ms: 1_772_359_200_000,
                }],
                pollers: vec![PollerHandle {
                    instance_id: "unix:@mykitty-4242".to_string(),
                    poller_id: 3,
                    phase: PollerPhase::Running,
                    started_at_ms: 1_772_359_100_000,
                    cycles: 12,
                }],
            }),
            ..signal_envelope()
        };

        for message in [signal_envelope(), report] {
            let frame = encode_frame(&message, DEFAULT_MAX_FRAME_BYTES).expect("encode");
            assert_eq!(frame.last(), Some(&b'\n'));
            let decoded: HookEnvelope =
                decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn wire_shape_uses_type_and_payload() {
        let value = serde_json::to_value(signal_envelope()).expect("to value");
        assert_eq!(value["type"], "signal");
        assert_eq!(value["version"], "1");
        assert_eq!(value["payload"]["event"], "stop");
        assert_eq!(value["payload"]["window_id"], 7);
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let message = HookEnvelope {
            msg: HookMsg::Error(ErrorPayload {
                code: "blob".to_string(),
                message: "x".repeat(256),
            }),
            ..signal_envelope()
        };
        let result = encode_frame(&message, 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn decoder_rejects_oversized_and_malformed_lines() {
        let oversized = format!("{{\"blob\":\"{}\"}}\n", "x".repeat(2_000));
        let result = decode_frame::<HookEnvelope>(oversized.as_bytes(), 1_024);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));

        let malformed = decode_frame::<HookEnvelope>(b"{\"type\":\"signal\"\r\n", 1_024);
        assert!(matches!(malformed, Err(FrameError::Decode(_))));
    }

    #[test]
    fn version_field_accepts_string_number_and_missing() {
        for raw in [
            r#"{"version":"1","type":"status","sender_id":"c","timestamp":"t","payload":{}}"#,
            r#"{"version":1,"type":"status","sender_id":"c","timestamp":"t","payload":{}}"#,
            r#"{"type":"status","sender_id":"c","timestamp":"t","payload":{}}"#,
        ] {
            let parsed: HookEnvelope = serde_json::from_str(raw).expect("parse");
            assert_eq!(parsed.version, ProtocolVersion(1));
            assert_eq!(parsed.msg, HookMsg::Status(StatusRequest::default()));
        }

        let future: HookEnvelope = serde_json::from_str(
            r#"{"version":"9","type":"status","sender_id":"c","timestamp":"t","payload":{}}"#,
        )
        .expect("parse future version");
        assert_eq!(future.version, ProtocolVersion(9));
    }
}
