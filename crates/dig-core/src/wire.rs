//! Text codec for the push channel: Engine.IO v4 packets carrying Socket.IO
//! packets, plus the typed investigation events found inside them.
//!
//! Only the text transport is spoken. Binary attachments are rejected as
//! unsupported; the investigation server never sends them.

use crate::{clamp_confidence, deserialize_data, deserialize_id, AgentName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const DEFAULT_NAMESPACE: &str = "/";
pub const ENGINE_IO_VERSION: u8 = 4;

pub const EVENT_AGENT_MESSAGE: &str = "agent_message";
pub const EVENT_CONFIDENCE_UPDATE: &str = "confidence_update";
pub const EVENT_INVESTIGATION_COMPLETE: &str = "investigation_complete";
pub const EVENT_INVESTIGATION_ERROR: &str = "investigation_error";
pub const EVENT_SUBSCRIBE: &str = "subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "unsubscribe";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("unknown packet type '{0}'")]
    UnknownPacketType(char),
    #[error("unsupported packet: {0}")]
    Unsupported(String),
}

/// Handshake body of the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenPayload),
    Close,
    Ping(Option<String>),
    Pong(Option<String>),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        payload: Value,
    },
    Ack {
        namespace: String,
        ack_id: u64,
        data: Value,
    },
    ConnectError {
        namespace: String,
        data: Option<Value>,
    },
}

impl SocketPacket {
    pub fn connect() -> Self {
        SocketPacket::Connect {
            namespace: DEFAULT_NAMESPACE.to_string(),
            data: None,
        }
    }

    pub fn event(name: &str, payload: Value) -> Self {
        SocketPacket::Event {
            namespace: DEFAULT_NAMESPACE.to_string(),
            ack_id: None,
            name: name.to_string(),
            payload,
        }
    }

    fn type_digit(&self) -> char {
        match self {
            SocketPacket::Connect { .. } => '0',
            SocketPacket::Disconnect { .. } => '1',
            SocketPacket::Event { .. } => '2',
            SocketPacket::Ack { .. } => '3',
            SocketPacket::ConnectError { .. } => '4',
        }
    }

    fn namespace(&self) -> &str {
        match self {
            SocketPacket::Connect { namespace, .. }
            | SocketPacket::Disconnect { namespace }
            | SocketPacket::Event { namespace, .. }
            | SocketPacket::Ack { namespace, .. }
            | SocketPacket::ConnectError { namespace, .. } => namespace,
        }
    }
}

pub fn subscribe_packet(investigation_id: &str) -> EnginePacket {
    EnginePacket::Message(SocketPacket::event(
        EVENT_SUBSCRIBE,
        serde_json::json!({ "investigation_id": investigation_id }),
    ))
}

pub fn unsubscribe_packet(investigation_id: &str) -> EnginePacket {
    EnginePacket::Message(SocketPacket::event(
        EVENT_UNSUBSCRIBE,
        serde_json::json!({ "investigation_id": investigation_id }),
    ))
}

pub fn encode_packet(packet: &EnginePacket) -> Result<String, FrameError> {
    let encoded = match packet {
        EnginePacket::Open(payload) => {
            let body =
                serde_json::to_string(payload).map_err(|err| FrameError::Encode(err.to_string()))?;
            format!("0{body}")
        }
        EnginePacket::Close => "1".to_string(),
        EnginePacket::Ping(payload) => format!("2{}", payload.as_deref().unwrap_or_default()),
        EnginePacket::Pong(payload) => format!("3{}", payload.as_deref().unwrap_or_default()),
        EnginePacket::Message(inner) => format!("4{}", encode_socket_packet(inner)?),
        EnginePacket::Upgrade => "5".to_string(),
        EnginePacket::Noop => "6".to_string(),
    };
    Ok(encoded)
}

fn encode_socket_packet(packet: &SocketPacket) -> Result<String, FrameError> {
    let mut out = String::new();
    out.push(packet.type_digit());
    let namespace = packet.namespace();
    if namespace != DEFAULT_NAMESPACE {
        out.push_str(namespace);
        out.push(',');
    }
    let data = match packet {
        SocketPacket::Connect { data, .. } | SocketPacket::ConnectError { data, .. } => {
            data.clone()
        }
        SocketPacket::Disconnect { .. } => None,
        SocketPacket::Event {
            ack_id,
            name,
            payload,
            ..
        } => {
            if let Some(ack_id) = ack_id {
                out.push_str(&ack_id.to_string());
            }
            let args = if payload.is_null() {
                serde_json::json!([name])
            } else {
                serde_json::json!([name, payload])
            };
            Some(args)
        }
        SocketPacket::Ack { ack_id, data, .. } => {
            out.push_str(&ack_id.to_string());
            Some(data.clone())
        }
    };
    if let Some(data) = data {
        let body = serde_json::to_string(&data).map_err(|err| FrameError::Encode(err.to_string()))?;
        out.push_str(&body);
    }
    Ok(out)
}

pub fn decode_packet(text: &str, max_frame_bytes: usize) -> Result<EnginePacket, FrameError> {
    if text.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    let mut chars = text.chars();
    let kind = chars
        .next()
        .ok_or_else(|| FrameError::Decode("empty packet".to_string()))?;
    let rest = chars.as_str();
    let payload = || (!rest.is_empty()).then(|| rest.to_string());
    match kind {
        '0' => serde_json::from_str(rest)
            .map(EnginePacket::Open)
            .map_err(|err| FrameError::Decode(err.to_string())),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping(payload())),
        '3' => Ok(EnginePacket::Pong(payload())),
        '4' => decode_socket_packet(rest).map(EnginePacket::Message),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(FrameError::UnknownPacketType(other)),
    }
}

fn decode_socket_packet(raw: &str) -> Result<SocketPacket, FrameError> {
    let mut chars = raw.chars();
    let kind = chars
        .next()
        .ok_or_else(|| FrameError::Decode("empty socket packet".to_string()))?;
    let mut rest = chars.as_str();
    if matches!(kind, '5' | '6') {
        return Err(FrameError::Unsupported(format!(
            "binary socket packet type {kind}"
        )));
    }

    let namespace = if rest.starts_with('/') {
        let (namespace, tail) = rest.split_once(',').unwrap_or((rest, ""));
        rest = tail;
        namespace.to_string()
    } else {
        DEFAULT_NAMESPACE.to_string()
    };

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let ack_id = if digits > 0 {
        let parsed = rest[..digits]
            .parse::<u64>()
            .map_err(|err| FrameError::Decode(format!("invalid ack id: {err}")))?;
        Some(parsed)
    } else {
        None
    };
    rest = &rest[digits..];

    let data: Option<Value> = if rest.is_empty() {
        None
    } else {
        Some(serde_json::from_str(rest).map_err(|err| FrameError::Decode(err.to_string()))?)
    };

    match kind {
        '0' => Ok(SocketPacket::Connect { namespace, data }),
        '1' => Ok(SocketPacket::Disconnect { namespace }),
        '2' => {
            let Some(Value::Array(mut args)) = data else {
                return Err(FrameError::Decode(
                    "event packet without argument array".to_string(),
                ));
            };
            if args.is_empty() {
                return Err(FrameError::Decode("event packet without name".to_string()));
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                other => {
                    return Err(FrameError::Decode(format!(
                        "event name must be a string, got {other}"
                    )))
                }
            };
            let payload = if args.is_empty() {
                Value::Null
            } else {
                args.swap_remove(0)
            };
            Ok(SocketPacket::Event {
                namespace,
                ack_id,
                name,
                payload,
            })
        }
        '3' => Ok(SocketPacket::Ack {
            namespace,
            ack_id: ack_id
                .ok_or_else(|| FrameError::Decode("ack packet without id".to_string()))?,
            data: data.unwrap_or(Value::Null),
        }),
        '4' => Ok(SocketPacket::ConnectError { namespace, data }),
        other => Err(FrameError::UnknownPacketType(other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PushEventKind {
    AgentMessage,
    ConfidenceUpdate,
    InvestigationComplete,
    InvestigationError,
}

impl PushEventKind {
    pub const ALL: [PushEventKind; 4] = [
        PushEventKind::AgentMessage,
        PushEventKind::ConfidenceUpdate,
        PushEventKind::InvestigationComplete,
        PushEventKind::InvestigationError,
    ];

    pub fn event_name(&self) -> &'static str {
        match self {
            PushEventKind::AgentMessage => EVENT_AGENT_MESSAGE,
            PushEventKind::ConfidenceUpdate => EVENT_CONFIDENCE_UPDATE,
            PushEventKind::InvestigationComplete => EVENT_INVESTIGATION_COMPLETE,
            PushEventKind::InvestigationError => EVENT_INVESTIGATION_ERROR,
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        PushEventKind::ALL
            .into_iter()
            .find(|kind| kind.event_name() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentMessagePayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub investigation_id: String,
    pub agent_name: AgentName,
    #[serde(default)]
    pub message: String,
    #[serde(default, deserialize_with = "deserialize_data")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConfidencePayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub investigation_id: String,
    pub confidence: f64,
}

impl ConfidencePayload {
    pub fn value(&self) -> Option<u8> {
        clamp_confidence(self.confidence)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvestigationRef {
    #[serde(deserialize_with = "deserialize_id")]
    pub investigation_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InvestigationErrorPayload {
    #[serde(deserialize_with = "deserialize_id")]
    pub investigation_id: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// The four server events the watcher understands.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    AgentMessage(AgentMessagePayload),
    ConfidenceUpdate(ConfidencePayload),
    InvestigationComplete(InvestigationRef),
    InvestigationError(InvestigationErrorPayload),
}

impl PushEvent {
    /// `Ok(None)` for event names outside the known set; those are ignored,
    /// not errors.
    pub fn from_event(name: &str, payload: Value) -> Result<Option<Self>, FrameError> {
        let Some(kind) = PushEventKind::from_event_name(name) else {
            return Ok(None);
        };
        let decode_err = |err: serde_json::Error| FrameError::Decode(format!("{name}: {err}"));
        let event = match kind {
            PushEventKind::AgentMessage => {
                PushEvent::AgentMessage(serde_json::from_value(payload).map_err(decode_err)?)
            }
            PushEventKind::ConfidenceUpdate => {
                PushEvent::ConfidenceUpdate(serde_json::from_value(payload).map_err(decode_err)?)
            }
            PushEventKind::InvestigationComplete => PushEvent::InvestigationComplete(
                serde_json::from_value(payload).map_err(decode_err)?,
            ),
            PushEventKind::InvestigationError => {
                PushEvent::InvestigationError(serde_json::from_value(payload).map_err(decode_err)?)
            }
        };
        Ok(Some(event))
    }

    pub fn kind(&self) -> PushEventKind {
        match self {
            PushEvent::AgentMessage(_) => PushEventKind::AgentMessage,
            PushEvent::ConfidenceUpdate(_) => PushEventKind::ConfidenceUpdate,
            PushEvent::InvestigationComplete(_) => PushEventKind::InvestigationComplete,
            PushEvent::InvestigationError(_) => PushEventKind::InvestigationError,
        }
    }

    pub fn investigation_id(&self) -> &str {
        match self {
            PushEvent::AgentMessage(payload) => &payload.investigation_id,
            PushEvent::ConfidenceUpdate(payload) => &payload.investigation_id,
            PushEvent::InvestigationComplete(payload) => &payload.investigation_id,
            PushEvent::InvestigationError(payload) => &payload.investigation_id,
        }
    }
}
