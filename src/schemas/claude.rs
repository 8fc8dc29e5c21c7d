//! Wire model for `claude -p --output-format stream-json` events.
//!
//! The stream interleaves system, assistant, and user envelopes; tool calls
//! arrive as `tool_use` content blocks on assistant messages and their
//! results as `tool_result` blocks on synthetic user messages.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StreamMessage {
    #[serde(rename = "system")]
    System(SystemMessage),
    #[serde(rename = "assistant")]
    Assistant(AssistantMessage),
    #[serde(rename = "user")]
    User(UserMessage),
    #[serde(rename = "result")]
    Result(ResultMessage),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemMessage {
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, rename = "permissionMode")]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    pub message: MessageBody,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    pub message: MessageBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Tool result content is a plain string or an array of content blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Structured(Vec<Value>),
}

impl ToolResultContent {
    /// Flatten to display text; image blocks collapse to a placeholder.
    pub fn to_text(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Structured(items) => {
                let mut parts = Vec::new();
                for item in items {
                    let Some(obj) = item.as_object() else { continue };
                    if obj.get("type").and_then(Value::as_str) == Some("image") {
                        parts.push("[image]".to_string());
                    } else if let Some(text) = obj.get("text").and_then(Value::as_str) {
                        parts.push(text.to_string());
                    }
                }
                parts.join("\n")
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultMessage {
    #[serde(default)]
    pub subtype: Option<String>,
    pub session_id: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub usage: Option<Value>,
}

impl ResultMessage {
    pub fn error_message(&self) -> String {
        if let Some(result) = self.result.as_deref().filter(|s| !s.is_empty()) {
            return result.to_string();
        }
        match self.subtype.as_deref() {
            Some(subtype) => format!("claude run failed ({subtype})"),
            None => "claude run failed".to_string(),
        }
    }
}

pub fn decode_stream_line(line: &[u8]) -> Result<StreamMessage, serde_json::Error> {
    serde_json::from_slice(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_init_system_message() {
        let line = json!({
            "type": "system",
            "subtype": "init",
            "session_id": "sess-1",
            "model": "claude-x",
            "cwd": "/work",
            "tools": ["Bash", "Read"]
        });
        let msg = decode_stream_line(line.to_string().as_bytes()).unwrap();
        match msg {
            StreamMessage::System(sys) => {
                assert_eq!(sys.subtype, "init");
                assert_eq!(sys.session_id.as_deref(), Some("sess-1"));
                assert_eq!(sys.tools.len(), 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decodes_tool_use_and_result_blocks() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "running"},
                {"type": "tool_use", "id": "tu1", "name": "Bash", "input": {"command": "ls"}}
            ]}
        });
        let msg = decode_stream_line(line.to_string().as_bytes()).unwrap();
        match msg {
            StreamMessage::Assistant(evt) => {
                assert_eq!(evt.message.content.len(), 2);
                assert!(matches!(
                    &evt.message.content[1],
                    ContentBlock::ToolUse { id, .. } if id == "tu1"
                ));
            }
            other => panic!("unexpected: {other:?}"),
        }

        let line = json!({
            "type": "user",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "tu1", "content": "ok", "is_error": false}
            ]}
        });
        let msg = decode_stream_line(line.to_string().as_bytes()).unwrap();
        match msg {
            StreamMessage::User(evt) => match &evt.message.content[0] {
                ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                    assert_eq!(tool_use_id, "tu1");
                    assert_eq!(content.as_ref().unwrap().to_text(), "ok");
                    assert!(!is_error);
                }
                other => panic!("unexpected: {other:?}"),
            },
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn structured_tool_result_flattens_images() {
        let content = ToolResultContent::Structured(vec![
            json!({"type": "text", "text": "before"}),
            json!({"type": "image", "source": {}}),
        ]);
        assert_eq!(content.to_text(), "before\n[image]");
    }

    #[test]
    fn unknown_blocks_and_messages_decode() {
        let msg = decode_stream_line(br#"{"type":"stream_event","event":{}}"#).unwrap();
        assert!(matches!(msg, StreamMessage::Unknown));
        let line = json!({
            "type": "assistant",
            "message": {"content": [{"type": "server_tool_use", "id": "x"}]}
        });
        let msg = decode_stream_line(line.to_string().as_bytes()).unwrap();
        match msg {
            StreamMessage::Assistant(evt) => {
                assert!(matches!(evt.message.content[0], ContentBlock::Unknown));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn result_error_message_prefers_result_text() {
        let msg: ResultMessage = serde_json::from_value(json!({
            "subtype": "error_during_execution",
            "session_id": "s",
            "is_error": true
        }))
        .unwrap();
        assert_eq!(msg.error_message(), "claude run failed (error_during_execution)");
    }
}
