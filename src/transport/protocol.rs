//! Wire format of the backend event channel
//!
//! Every frame is a JSON object with a `type` discriminant:
//!
//! ```text
//! → {"type":"auth","token":"..."}                 first frame when a token is set
//! → {"type":"command","action":"get_history",...}
//! → {"type":"ping"}
//! ← {"type":"pong"}
//! ← {"type":"transcript","text":"...",...}
//! ```

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;

/// Action name that encodes as a bare heartbeat frame
pub const PING_ACTION: &str = "ping";

/// Inbound frame discriminants the host understands
///
/// Anything else is protocol noise and gets dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Status,
    Transcript,
    AudioLevel,
    ModelProgress,
    ModelInfo,
    Error,
    Config,
    History,
    Devices,
    Rewards,
    Tags,
    Pong,
}

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::Status,
        MessageKind::Transcript,
        MessageKind::AudioLevel,
        MessageKind::ModelProgress,
        MessageKind::ModelInfo,
        MessageKind::Error,
        MessageKind::Config,
        MessageKind::History,
        MessageKind::Devices,
        MessageKind::Rewards,
        MessageKind::Tags,
        MessageKind::Pong,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Status => "status",
            MessageKind::Transcript => "transcript",
            MessageKind::AudioLevel => "audio_level",
            MessageKind::ModelProgress => "model_progress",
            MessageKind::ModelInfo => "model_info",
            MessageKind::Error => "error",
            MessageKind::Config => "config",
            MessageKind::History => "history",
            MessageKind::Devices => "devices",
            MessageKind::Rewards => "rewards",
            MessageKind::Tags => "tags",
            MessageKind::Pong => "pong",
        }
    }

    pub fn from_type(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed inbound frame
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: MessageKind,
    /// Every field except `type`
    pub fields: Map<String, Value>,
}

impl Envelope {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// `message` field, as carried by `error` and `status` frames
    pub fn message(&self) -> Option<&str> {
        self.get_str("message")
    }
}

/// Parse a text frame; None for anything that is not a known envelope
pub fn parse_frame(text: &str) -> Option<Envelope> {
    let Value::Object(mut fields) = serde_json::from_str::<Value>(text).ok()? else {
        return None;
    };
    let kind = match fields.remove("type") {
        Some(Value::String(kind)) => MessageKind::from_type(&kind)?,
        _ => return None,
    };
    Some(Envelope { kind, fields })
}

/// Encode an outbound command frame
///
/// `type` and `action` always win over same-named payload keys.
pub fn encode_outbound(action: &str, payload: &Map<String, Value>) -> String {
    if action == PING_ACTION {
        return ping_frame();
    }
    let mut frame = payload.clone();
    frame.insert("type".to_string(), Value::String("command".to_string()));
    frame.insert("action".to_string(), Value::String(action.to_string()));
    Value::Object(frame).to_string()
}

pub fn ping_frame() -> String {
    json!({ "type": "ping" }).to_string()
}

pub fn auth_frame(token: &str) -> String {
    json!({ "type": "auth", "token": token }).to_string()
}

/// Commands the backend accepts
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    StartRecording,
    StopRecording,
    GetDevices,
    GetHistory,
    ClearHistory,
    DeleteHistoryEntry {
        id: String,
    },
    UpdateHistoryEntry {
        id: String,
        text: String,
    },
    GetConfig,
    SetConfig {
        key: String,
        value: Value,
    },
    SwitchModel {
        model: String,
    },
    GetRewards,
    AnnotateEntry {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        notes: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tags: Option<Vec<String>>,
    },
    GetTags,
    Shutdown,
}

impl Command {
    /// Split into the action name and the remaining fields
    pub fn to_parts(&self) -> (String, Map<String, Value>) {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                let action = match map.remove("action") {
                    Some(Value::String(action)) => action,
                    _ => String::new(),
                };
                (action, map)
            }
            _ => (String::new(), Map::new()),
        }
    }
}
