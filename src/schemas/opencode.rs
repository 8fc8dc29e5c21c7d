//! Wire model for `opencode run --format json` events.
//!
//! OpenCode streams loosely structured `part` payloads; the part body stays a
//! raw JSON value and the adapter picks out what it needs.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpenCodeEvent {
    StepStart {
        #[serde(default, rename = "sessionID")]
        session_id: Option<String>,
    },
    ToolUse {
        #[serde(default, rename = "sessionID")]
        session_id: Option<String>,
        #[serde(default)]
        part: Value,
    },
    Text {
        #[serde(default, rename = "sessionID")]
        session_id: Option<String>,
        #[serde(default)]
        part: Value,
    },
    StepFinish {
        #[serde(default, rename = "sessionID")]
        session_id: Option<String>,
        #[serde(default)]
        part: Value,
    },
    Error {
        #[serde(default, rename = "sessionID")]
        session_id: Option<String>,
        #[serde(default)]
        error: Option<Value>,
        #[serde(default)]
        message: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

impl OpenCodeEvent {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            OpenCodeEvent::StepStart { session_id }
            | OpenCodeEvent::ToolUse { session_id, .. }
            | OpenCodeEvent::Text { session_id, .. }
            | OpenCodeEvent::StepFinish { session_id, .. }
            | OpenCodeEvent::Error { session_id, .. } => session_id.as_deref(),
            OpenCodeEvent::Unknown => None,
        }
    }
}

pub fn decode_event(line: &[u8]) -> Result<OpenCodeEvent, serde_json::Error> {
    serde_json::from_slice(line)
}
