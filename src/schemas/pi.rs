//! Wire model for `pi --print --mode json` events.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PiEvent {
    Session {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    AgentStart,
    AgentEnd {
        #[serde(default)]
        messages: Vec<Value>,
    },
    MessageStart {
        #[serde(default)]
        message: Option<Value>,
    },
    MessageUpdate {
        #[serde(default)]
        message: Option<Value>,
    },
    MessageEnd {
        #[serde(default)]
        message: Option<Value>,
    },
    TurnStart,
    TurnEnd {
        #[serde(default)]
        message: Option<Value>,
    },
    ToolExecutionStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(default, rename = "toolName")]
        tool_name: Option<String>,
        #[serde(default)]
        args: Value,
    },
    ToolExecutionUpdate {
        #[serde(default, rename = "toolCallId")]
        tool_call_id: Option<String>,
    },
    ToolExecutionEnd {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(default, rename = "toolName")]
        tool_name: Option<String>,
        #[serde(default)]
        result: Value,
        #[serde(default, rename = "isError")]
        is_error: bool,
    },
    AutoCompactionStart {
        #[serde(default)]
        reason: Option<String>,
    },
    AutoCompactionEnd,
    AutoRetryStart {
        #[serde(default)]
        attempt: Option<u32>,
        #[serde(default, rename = "maxAttempts")]
        max_attempts: Option<u32>,
        #[serde(default, rename = "errorMessage")]
        error_message: Option<String>,
    },
    AutoRetryEnd,
    #[serde(other)]
    Unknown,
}

pub fn decode_event(line: &[u8]) -> Result<PiEvent, serde_json::Error> {
    serde_json::from_slice(line)
}
