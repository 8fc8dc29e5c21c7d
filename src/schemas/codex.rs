//! Wire model for `codex exec --json` thread events.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ThreadEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },
    #[serde(rename = "turn.started")]
    TurnStarted,
    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Option<Value>,
    },
    #[serde(rename = "turn.failed")]
    TurnFailed { error: TurnError },
    #[serde(rename = "item.started")]
    ItemStarted { item: ThreadItem },
    #[serde(rename = "item.updated")]
    ItemUpdated { item: ThreadItem },
    #[serde(rename = "item.completed")]
    ItemCompleted { item: ThreadItem },
    /// Transient stream-level notices (rate limits, reconnects).
    #[serde(rename = "error")]
    StreamError { message: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnError {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "item_type", rename_all = "snake_case")]
pub enum ThreadItem {
    AgentMessage {
        id: String,
        text: String,
    },
    Reasoning {
        id: String,
        text: String,
    },
    CommandExecution {
        id: String,
        command: String,
        #[serde(default)]
        exit_code: Option<i64>,
        #[serde(default)]
        status: Option<String>,
    },
    McpToolCall {
        id: String,
        #[serde(default)]
        server: Option<String>,
        #[serde(default)]
        tool: Option<String>,
        #[serde(default)]
        arguments: Option<Value>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<TurnError>,
    },
    WebSearch {
        id: String,
        query: String,
    },
    FileChange {
        id: String,
        #[serde(default)]
        changes: Vec<FileUpdateChange>,
        #[serde(default)]
        status: Option<String>,
    },
    TodoList {
        id: String,
        #[serde(default)]
        items: Vec<TodoItem>,
    },
    Error {
        id: String,
        message: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileUpdateChange {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TodoItem {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub completed: bool,
}

pub fn decode_event(line: &[u8]) -> Result<ThreadEvent, serde_json::Error> {
    serde_json::from_slice(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_thread_started() {
        let evt = decode_event(br#"{"type":"thread.started","thread_id":"t-1"}"#).unwrap();
        assert!(matches!(evt, ThreadEvent::ThreadStarted { thread_id } if thread_id == "t-1"));
    }

    #[test]
    fn decodes_command_item_with_missing_exit_code() {
        let evt = decode_event(
            br#"{"type":"item.started","item":{"item_type":"command_execution","id":"c1","command":"pytest"}}"#,
        )
        .unwrap();
        match evt {
            ThreadEvent::ItemStarted {
                item: ThreadItem::CommandExecution { id, command, exit_code, .. },
            } => {
                assert_eq!(id, "c1");
                assert_eq!(command, "pytest");
                assert!(exit_code.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_and_item_types_decode() {
        assert!(matches!(
            decode_event(br#"{"type":"something.new","x":1}"#).unwrap(),
            ThreadEvent::Unknown
        ));
        let evt = decode_event(
            br#"{"type":"item.completed","item":{"item_type":"novel_thing","id":"n1"}}"#,
        )
        .unwrap();
        assert!(matches!(
            evt,
            ThreadEvent::ItemCompleted { item: ThreadItem::Unknown }
        ));
    }

    #[test]
    fn decodes_turn_completed_usage() {
        let evt = decode_event(
            br#"{"type":"turn.completed","usage":{"input_tokens":10,"output_tokens":3}}"#,
        )
        .unwrap();
        match evt {
            ThreadEvent::TurnCompleted { usage } => {
                assert_eq!(usage.unwrap()["input_tokens"], 10);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
