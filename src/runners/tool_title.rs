//! Tool name → (kind, title) mapping shared by the claude, opencode, and pi
//! adapters, which all report the same family of workspace tools.

use std::path::Path;

use serde_json::Value;

use crate::model::ActionKind;
use crate::paths::{relativize_command, relativize_path};

fn input_str<'a>(input: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| input.get(*key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

pub fn tool_path(input: &Value) -> Option<&str> {
    input_str(input, &["file_path", "filePath", "path"])
}

/// Map a workspace tool invocation to a normalized action kind and a short
/// chat-friendly title.
pub fn tool_kind_and_title(name: &str, input: &Value, base: Option<&Path>) -> (ActionKind, String) {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "bash" | "shell" | "killshell" => {
            let command = input_str(input, &["command"]).unwrap_or(name);
            (ActionKind::Command, relativize_command(command, base))
        }
        "edit" | "write" | "multiedit" | "notebookedit" => match tool_path(input) {
            Some(path) => (ActionKind::FileChange, relativize_path(path, base)),
            None => (ActionKind::FileChange, name.to_string()),
        },
        "read" => match tool_path(input) {
            Some(path) => (
                ActionKind::Tool,
                format!("read: `{}`", relativize_path(path, base)),
            ),
            None => (ActionKind::Tool, "read".to_string()),
        },
        "glob" => match input_str(input, &["pattern"]) {
            Some(pattern) => (ActionKind::Tool, format!("glob: `{pattern}`")),
            None => (ActionKind::Tool, "glob".to_string()),
        },
        "grep" => match input_str(input, &["pattern"]) {
            Some(pattern) => (ActionKind::Tool, format!("grep: {pattern}")),
            None => (ActionKind::Tool, "grep".to_string()),
        },
        "websearch" | "web_search" => (
            ActionKind::WebSearch,
            input_str(input, &["query"]).unwrap_or("search").to_string(),
        ),
        "webfetch" | "web_fetch" => (
            ActionKind::WebSearch,
            input_str(input, &["url"]).unwrap_or("fetch").to_string(),
        ),
        "todowrite" => (ActionKind::Note, "update todos".to_string()),
        "todoread" => (ActionKind::Note, "read todos".to_string()),
        "askuserquestion" => (ActionKind::Note, "ask user".to_string()),
        "task" | "agent" => (
            ActionKind::Subagent,
            input_str(input, &["description", "prompt"])
                .unwrap_or(name)
                .to_string(),
        ),
        _ => (ActionKind::Tool, name.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    #[test]
    fn bash_maps_to_command_with_relativized_text() {
        let base = PathBuf::from("/work");
        let (kind, title) = tool_kind_and_title(
            "Bash",
            &json!({"command": "pytest /work/tests"}),
            Some(&base),
        );
        assert_eq!(kind, ActionKind::Command);
        assert_eq!(title, "pytest tests");
    }

    #[test]
    fn edit_maps_to_file_change() {
        let base = PathBuf::from("/work");
        let (kind, title) =
            tool_kind_and_title("Edit", &json!({"file_path": "/work/src/a.rs"}), Some(&base));
        assert_eq!(kind, ActionKind::FileChange);
        assert_eq!(title, "src/a.rs");
    }

    #[test]
    fn task_maps_to_subagent_with_description() {
        let (kind, title) =
            tool_kind_and_title("Task", &json!({"description": "fix tests"}), None);
        assert_eq!(kind, ActionKind::Subagent);
        assert_eq!(title, "fix tests");
    }

    #[test]
    fn unknown_tools_keep_their_name() {
        let (kind, title) = tool_kind_and_title("mcp.weird", &json!({}), None);
        assert_eq!(kind, ActionKind::Tool);
        assert_eq!(title, "mcp.weird");
    }
}
