//! Codex engine adapter (`codex exec --json`).

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{opt_str, opt_str_list, ConfigError, EngineTable};
use crate::driver::{JsonlDriver, JsonlEngine, Notes};
use crate::model::{
    Action, ActionKind, ActionPhase, EngineId, Event, EventFactory, ResumeToken,
};
use crate::paths::relativize_command;
use crate::resume::ResumeCodec;
use crate::runner::{Runner, RunnerError};
use crate::schemas::codex::{self, ThreadEvent, ThreadItem};

pub const ENGINE: &str = "codex";

static RESUME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*`?codex\s+resume\s+(?P<token>[^`\s]+)`?\s*$").expect("codex resume regex")
});

static RECONNECTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^Reconnecting\.{3}\s*(?P<attempt>\d+)/(?P<max>\d+)\s*$")
        .expect("codex reconnect regex")
});

pub struct CodexState {
    factory: EventFactory,
    final_answer: Option<String>,
    turn_index: u32,
    base_dir: Option<PathBuf>,
}

pub struct CodexEngine {
    engine: EngineId,
    codec: ResumeCodec,
    codex_cmd: String,
    extra_args: Vec<String>,
    session_title: String,
}

impl CodexEngine {
    pub fn new(extra_args: Vec<String>, session_title: String) -> Self {
        let engine = EngineId::new(ENGINE);
        Self {
            codec: ResumeCodec::new(engine.clone(), RESUME_RE.clone()),
            engine,
            codex_cmd: ENGINE.to_string(),
            extra_args,
            session_title,
        }
    }

    fn translate_item(
        &self,
        phase: ActionPhase,
        item: ThreadItem,
        state: &mut CodexState,
    ) -> Vec<Event> {
        let factory = &state.factory;
        let completed = phase == ActionPhase::Completed;
        match item {
            ThreadItem::AgentMessage { text, .. } => {
                if completed {
                    if state.final_answer.is_some() {
                        debug!("codex.multiple_agent_messages");
                    }
                    state.final_answer = Some(text);
                }
                vec![]
            }
            ThreadItem::Error { id, message } => {
                if !completed {
                    return vec![];
                }
                let mut detail = Map::new();
                detail.insert("message".into(), message.clone().into());
                let action = Action::new(id, ActionKind::Warning, message).with_detail(detail);
                vec![factory.action_completed(action, false)]
            }
            ThreadItem::CommandExecution {
                id,
                command,
                exit_code,
                status,
            } => {
                let title = relativize_command(&command, state.base_dir.as_deref());
                if !completed {
                    return vec![factory.action(phase, Action::new(id, ActionKind::Command, title))];
                }
                let mut ok = status.as_deref() == Some("completed");
                if let Some(code) = exit_code {
                    ok = ok && code == 0;
                }
                let mut detail = Map::new();
                if let Some(code) = exit_code {
                    detail.insert("exit_code".into(), code.into());
                }
                if let Some(status) = status {
                    detail.insert("status".into(), status.into());
                }
                let action = Action::new(id, ActionKind::Command, title).with_detail(detail);
                vec![factory.action_completed(action, ok)]
            }
            ThreadItem::McpToolCall {
                id,
                server,
                tool,
                arguments,
                status,
                result,
                error,
            } => {
                let title = match (&server, &tool) {
                    (Some(server), Some(tool)) => format!("{server}.{tool}"),
                    (Some(name), None) | (None, Some(name)) => name.clone(),
                    (None, None) => "tool".to_string(),
                };
                let mut detail = Map::new();
                if let Some(server) = server {
                    detail.insert("server".into(), server.into());
                }
                if let Some(tool) = tool {
                    detail.insert("tool".into(), tool.into());
                }
                if let Some(arguments) = arguments {
                    detail.insert("arguments".into(), arguments);
                }
                if let Some(status) = &status {
                    detail.insert("status".into(), status.clone().into());
                }
                if !completed {
                    let action = Action::new(id, ActionKind::Tool, title).with_detail(detail);
                    return vec![factory.action(phase, action)];
                }
                let ok = status.as_deref() == Some("completed") && error.is_none();
                if let Some(error) = error {
                    detail.insert("error_message".into(), error.message.into());
                }
                if let Some(result) = result {
                    detail.insert("result_summary".into(), summarize_tool_result(&result));
                }
                let action = Action::new(id, ActionKind::Tool, title).with_detail(detail);
                vec![factory.action_completed(action, ok)]
            }
            ThreadItem::WebSearch { id, query } => {
                let mut detail = Map::new();
                detail.insert("query".into(), query.clone().into());
                let action = Action::new(id, ActionKind::WebSearch, query).with_detail(detail);
                if completed {
                    vec![factory.action_completed(action, true)]
                } else {
                    vec![factory.action(phase, action)]
                }
            }
            ThreadItem::FileChange { id, changes, status } => {
                if !completed {
                    return vec![];
                }
                let paths: Vec<&str> = changes
                    .iter()
                    .filter(|c| !c.path.is_empty())
                    .map(|c| c.path.as_str())
                    .collect();
                let title = if paths.is_empty() {
                    format!("{} files", changes.len())
                } else {
                    paths.join(", ")
                };
                let normalized: Vec<Value> = changes
                    .iter()
                    .filter(|c| !c.path.is_empty())
                    .map(|c| {
                        let mut entry = Map::new();
                        entry.insert("path".into(), c.path.clone().into());
                        if let Some(kind) = &c.kind {
                            entry.insert("kind".into(), kind.clone().into());
                        }
                        Value::Object(entry)
                    })
                    .collect();
                let ok = status.as_deref() == Some("completed");
                let mut detail = Map::new();
                detail.insert("changes".into(), Value::Array(normalized));
                if let Some(status) = status {
                    detail.insert("status".into(), status.into());
                }
                let action = Action::new(id, ActionKind::FileChange, title).with_detail(detail);
                vec![factory.action_completed(action, ok)]
            }
            ThreadItem::TodoList { id, items } => {
                let total = items.len();
                let done = items.iter().filter(|i| i.completed).count();
                let next = items.iter().find(|i| !i.completed).map(|i| i.text.as_str());
                let title = if total == 0 {
                    "todo".to_string()
                } else {
                    match next {
                        Some(next) => format!("todo {done}/{total}: {next}"),
                        None => format!("todo {done}/{total}: done"),
                    }
                };
                let mut detail = Map::new();
                detail.insert("done".into(), (done as u64).into());
                detail.insert("total".into(), (total as u64).into());
                let action = Action::new(id, ActionKind::Note, title).with_detail(detail);
                if completed {
                    vec![factory.action_completed(action, true)]
                } else {
                    vec![factory.action(phase, action)]
                }
            }
            ThreadItem::Reasoning { id, text } => {
                let action = Action::new(id, ActionKind::Note, text);
                if completed {
                    vec![factory.action_completed(action, true)]
                } else {
                    vec![factory.action(phase, action)]
                }
            }
            ThreadItem::Unknown => vec![],
        }
    }
}

fn summarize_tool_result(result: &Value) -> Value {
    let mut summary = Map::new();
    match result.get("content") {
        Some(Value::Array(items)) => {
            summary.insert("content_blocks".into(), (items.len() as u64).into());
        }
        Some(Value::Null) | None => {}
        Some(_) => {
            summary.insert("content_blocks".into(), 1u64.into());
        }
    }
    summary.insert(
        "has_structured".into(),
        result
            .get("structured_content")
            .map(|v| !v.is_null())
            .unwrap_or(false)
            .into(),
    );
    Value::Object(summary)
}

impl JsonlEngine for CodexEngine {
    type State = CodexState;
    type Decoded = ThreadEvent;

    fn engine(&self) -> &EngineId {
        &self.engine
    }

    fn codec(&self) -> &ResumeCodec {
        &self.codec
    }

    fn program(&self) -> &str {
        &self.codex_cmd
    }

    fn format_resume(&self, token: &ResumeToken) -> Result<String, RunnerError> {
        if token.engine != self.engine {
            return Err(RunnerError::EngineMismatch {
                expected: self.engine.clone(),
                actual: token.engine.clone(),
            });
        }
        Ok(format!("`codex resume {}`", token.value))
    }

    fn new_state(
        &self,
        _prompt: &str,
        _resume: Option<&ResumeToken>,
        cwd: Option<&Path>,
    ) -> CodexState {
        CodexState {
            factory: EventFactory::new(self.engine.clone()),
            final_answer: None,
            turn_index: 0,
            base_dir: cwd.map(Path::to_path_buf),
        }
    }

    fn build_args(
        &self,
        _prompt: &str,
        resume: Option<&ResumeToken>,
        _state: &CodexState,
    ) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend(["exec", "--skip-git-repo-check", "--json"].map(String::from));
        match resume {
            Some(token) => args.extend(["resume".to_string(), token.value.clone(), "-".to_string()]),
            None => args.push("-".to_string()),
        }
        args
    }

    fn decode_line(&self, line: &[u8]) -> Result<ThreadEvent, serde_json::Error> {
        codex::decode_event(line)
    }

    fn translate(
        &self,
        decoded: ThreadEvent,
        state: &mut CodexState,
        resume: Option<&ResumeToken>,
        found: Option<&ResumeToken>,
    ) -> Vec<Event> {
        match decoded {
            ThreadEvent::ThreadStarted { thread_id } => {
                let token = ResumeToken::new(self.engine.clone(), thread_id);
                vec![state
                    .factory
                    .started(token, Some(self.session_title.clone()))]
            }
            ThreadEvent::StreamError { message } => {
                if let Some(captures) = RECONNECTING_RE.captures(&message) {
                    let attempt: u32 = captures["attempt"].parse().unwrap_or(0);
                    let max: u32 = captures["max"].parse().unwrap_or(0);
                    let phase = if attempt <= 1 {
                        ActionPhase::Started
                    } else {
                        ActionPhase::Updated
                    };
                    let mut detail = Map::new();
                    detail.insert("attempt".into(), attempt.into());
                    detail.insert("max".into(), max.into());
                    let action = Action::new("codex.reconnect", ActionKind::Note, message)
                        .with_detail(detail);
                    return vec![state.factory.action(phase, action)];
                }
                state.turn_index += 1;
                let id = format!("codex.stream_error.{}", state.turn_index);
                vec![state.factory.warning(id, &message, Map::new())]
            }
            ThreadEvent::TurnStarted => {
                let id = format!("turn_{}", state.turn_index);
                state.turn_index += 1;
                vec![state
                    .factory
                    .action_started(Action::new(id, ActionKind::Turn, "turn started"))]
            }
            ThreadEvent::TurnCompleted { usage } => {
                let answer = state.final_answer.take().unwrap_or_default();
                vec![state
                    .factory
                    .completed_ok(answer, found.or(resume).cloned(), usage)]
            }
            ThreadEvent::TurnFailed { error } => {
                let answer = state.final_answer.take().unwrap_or_default();
                vec![state.factory.completed_error(
                    error.message,
                    answer,
                    found.or(resume).cloned(),
                )]
            }
            ThreadEvent::ItemStarted { item } => {
                self.translate_item(ActionPhase::Started, item, state)
            }
            ThreadEvent::ItemUpdated { item } => {
                self.translate_item(ActionPhase::Updated, item, state)
            }
            ThreadEvent::ItemCompleted { item } => {
                self.translate_item(ActionPhase::Completed, item, state)
            }
            ThreadEvent::Unknown => vec![],
        }
    }

    fn stream_end_events(
        &self,
        resume: Option<&ResumeToken>,
        found: Option<&ResumeToken>,
        _notes: &mut Notes,
        state: &mut CodexState,
    ) -> Vec<Event> {
        let answer = state.final_answer.take().unwrap_or_default();
        match found {
            None => vec![state.factory.completed_error(
                "codex exec finished but no session_id/thread_id was captured",
                answer,
                resume.cloned(),
            )],
            Some(found) => vec![state
                .factory
                .completed_ok(answer, Some(found.clone()), None)],
        }
    }
}

pub fn build_runner(table: &EngineTable) -> Result<std::sync::Arc<dyn Runner>, ConfigError> {
    let engine = EngineId::new(ENGINE);
    let mut extra_args = opt_str_list(table, &engine, "extra_args")?
        .unwrap_or_else(|| vec!["-c".to_string(), "notify=[]".to_string()]);
    let mut title = "Codex".to_string();
    if let Some(profile) = opt_str(table, &engine, "profile")? {
        extra_args.extend(["--profile".to_string(), profile.clone()]);
        title = profile;
    }
    Ok(std::sync::Arc::new(JsonlDriver::new(CodexEngine::new(
        extra_args, title,
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CodexEngine {
        CodexEngine::new(vec!["-c".into(), "notify=[]".into()], "Codex".into())
    }

    fn state(engine: &CodexEngine) -> CodexState {
        engine.new_state("p", None, None)
    }

    #[test]
    fn resume_round_trip() {
        let engine = engine();
        let token = ResumeToken::new(EngineId::new(ENGINE), "U-123");
        let line = engine.format_resume(&token).unwrap();
        assert!(engine.codec().is_line(&line));
        assert_eq!(engine.codec().extract(&line).unwrap(), token);
    }

    #[test]
    fn build_args_places_resume_before_stdin_marker() {
        let engine = engine();
        let token = ResumeToken::new(EngineId::new(ENGINE), "U");
        let state = state(&engine);
        let args = engine.build_args("p", Some(&token), &state);
        assert_eq!(
            args,
            vec!["-c", "notify=[]", "exec", "--skip-git-repo-check", "--json", "resume", "U", "-"]
        );
    }

    #[test]
    fn thread_started_becomes_started_event() {
        let engine = engine();
        let mut state = state(&engine);
        let out = engine.translate(
            ThreadEvent::ThreadStarted { thread_id: "U".into() },
            &mut state,
            None,
            None,
        );
        assert_eq!(out.len(), 1);
        match &out[0] {
            Event::Started { resume, .. } => assert_eq!(resume.value, "U"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn turn_completed_uses_buffered_agent_message() {
        let engine = engine();
        let mut state = state(&engine);
        let found = ResumeToken::new(EngineId::new(ENGINE), "U");
        let out = engine.translate(
            ThreadEvent::ItemCompleted {
                item: ThreadItem::AgentMessage { id: "m1".into(), text: "Done.".into() },
            },
            &mut state,
            None,
            Some(&found),
        );
        assert!(out.is_empty());
        let out = engine.translate(
            ThreadEvent::TurnCompleted { usage: None },
            &mut state,
            None,
            Some(&found),
        );
        match &out[0] {
            Event::Completed { ok, answer, resume, .. } => {
                assert!(*ok);
                assert_eq!(answer, "Done.");
                assert_eq!(resume.as_ref().unwrap().value, "U");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn failed_command_item_is_not_ok() {
        let engine = engine();
        let mut state = state(&engine);
        let out = engine.translate(
            ThreadEvent::ItemCompleted {
                item: ThreadItem::CommandExecution {
                    id: "c1".into(),
                    command: "pytest".into(),
                    exit_code: Some(1),
                    status: Some("completed".into()),
                },
            },
            &mut state,
            None,
            None,
        );
        match &out[0] {
            Event::Action { ok, .. } => assert_eq!(*ok, Some(false)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn reconnect_messages_collapse_into_one_action_id() {
        let engine = engine();
        let mut state = state(&engine);
        let first = engine.translate(
            ThreadEvent::StreamError { message: "Reconnecting... 1/5".into() },
            &mut state,
            None,
            None,
        );
        let second = engine.translate(
            ThreadEvent::StreamError { message: "Reconnecting... 2/5".into() },
            &mut state,
            None,
            None,
        );
        let id_of = |evt: &Event| match evt {
            Event::Action { action, phase, .. } => (action.id.clone(), *phase),
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(id_of(&first[0]), ("codex.reconnect".into(), ActionPhase::Started));
        assert_eq!(id_of(&second[0]), ("codex.reconnect".into(), ActionPhase::Updated));
    }
}
