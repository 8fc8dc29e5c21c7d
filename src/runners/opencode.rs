//! OpenCode engine adapter (`opencode run --format json`).
//!
//! OpenCode streams step/tool/text parts; sessions use ids shaped like
//! `ses_494719016ffe85dkDMj0FPRbHK`.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::config::{opt_str, ConfigError, EngineTable};
use crate::driver::{JsonlDriver, JsonlEngine, Notes};
use crate::model::{Action, EngineId, Event, EventFactory, ResumeToken};
use crate::resume::ResumeCodec;
use crate::runner::{Runner, RunnerError};
use crate::runners::tool_title::{tool_kind_and_title, tool_path};
use crate::schemas::opencode::{self, OpenCodeEvent};

pub const ENGINE: &str = "opencode";

static RESUME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*`?opencode(?:\s+run)?\s+(?:--session|-s)\s+(?P<token>ses_[A-Za-z0-9]+)`?\s*$")
        .expect("opencode resume regex")
});

pub struct OpenCodeState {
    factory: EventFactory,
    session_id: Option<String>,
    emitted_started: bool,
    saw_step_finish: bool,
    last_text: Option<String>,
    base_dir: Option<PathBuf>,
}

pub struct OpenCodeEngine {
    engine: EngineId,
    codec: ResumeCodec,
    opencode_cmd: String,
    model: Option<String>,
    session_title: String,
}

impl OpenCodeEngine {
    pub fn new(model: Option<String>, session_title: String) -> Self {
        let engine = EngineId::new(ENGINE);
        Self {
            codec: ResumeCodec::new(engine.clone(), RESUME_RE.clone()),
            engine,
            opencode_cmd: ENGINE.to_string(),
            model,
            session_title,
        }
    }

    fn extract_tool_action(&self, part: &Value, base: Option<&Path>) -> Option<Action> {
        let call_id = part
            .get("callID")
            .and_then(Value::as_str)
            .or_else(|| part.get("id").and_then(Value::as_str))
            .filter(|s| !s.is_empty())?
            .to_string();
        let tool_name = part.get("tool").and_then(Value::as_str).unwrap_or("tool");
        let empty = Value::Object(Map::new());
        let tool_state = part.get("state").unwrap_or(&empty);
        let input = tool_state.get("input").unwrap_or(&empty);

        let (kind, mut title) = tool_kind_and_title(tool_name, input, base);
        if let Some(state_title) = tool_state.get("title").and_then(Value::as_str) {
            if !state_title.is_empty() && !state_title.contains('`') {
                title = state_title.to_string();
            }
        }

        let mut detail = Map::new();
        detail.insert("name".into(), tool_name.into());
        detail.insert("input".into(), input.clone());
        detail.insert("callID".into(), call_id.clone().into());
        if kind == crate::model::ActionKind::FileChange {
            if let Some(path) = tool_path(input) {
                let mut change = Map::new();
                change.insert("path".into(), path.into());
                change.insert("kind".into(), "update".into());
                detail.insert("changes".into(), Value::Array(vec![Value::Object(change)]));
            }
        }
        Some(Action::new(call_id, kind, title).with_detail(detail))
    }

    fn resume_from_state(&self, state: &OpenCodeState) -> Option<ResumeToken> {
        state
            .session_id
            .as_ref()
            .map(|id| ResumeToken::new(self.engine.clone(), id.clone()))
    }
}

impl JsonlEngine for OpenCodeEngine {
    type State = OpenCodeState;
    type Decoded = OpenCodeEvent;

    fn engine(&self) -> &EngineId {
        &self.engine
    }

    fn codec(&self) -> &ResumeCodec {
        &self.codec
    }

    fn program(&self) -> &str {
        &self.opencode_cmd
    }

    fn format_resume(&self, token: &ResumeToken) -> Result<String, RunnerError> {
        if token.engine != self.engine {
            return Err(RunnerError::EngineMismatch {
                expected: self.engine.clone(),
                actual: token.engine.clone(),
            });
        }
        Ok(format!("`opencode --session {}`", token.value))
    }

    fn new_state(
        &self,
        _prompt: &str,
        _resume: Option<&ResumeToken>,
        cwd: Option<&Path>,
    ) -> OpenCodeState {
        OpenCodeState {
            factory: EventFactory::new(self.engine.clone()),
            session_id: None,
            emitted_started: false,
            saw_step_finish: false,
            last_text: None,
            base_dir: cwd.map(Path::to_path_buf),
        }
    }

    fn build_args(
        &self,
        prompt: &str,
        resume: Option<&ResumeToken>,
        _state: &OpenCodeState,
    ) -> Vec<String> {
        let mut args: Vec<String> = ["run", "--format", "json"].map(String::from).into();
        if let Some(token) = resume {
            args.extend(["--session".to_string(), token.value.clone()]);
        }
        if let Some(model) = &self.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        args.push("--".to_string());
        args.push(prompt.to_string());
        args
    }

    fn stdin_payload(
        &self,
        _prompt: &str,
        _resume: Option<&ResumeToken>,
        _state: &OpenCodeState,
    ) -> Option<Vec<u8>> {
        None
    }

    fn decode_line(&self, line: &[u8]) -> Result<OpenCodeEvent, serde_json::Error> {
        opencode::decode_event(line)
    }

    fn translate(
        &self,
        decoded: OpenCodeEvent,
        state: &mut OpenCodeState,
        _resume: Option<&ResumeToken>,
        _found: Option<&ResumeToken>,
    ) -> Vec<Event> {
        if state.session_id.is_none() {
            if let Some(id) = decoded.session_id().filter(|s| !s.is_empty()) {
                state.session_id = Some(id.to_string());
            }
        }

        match decoded {
            OpenCodeEvent::StepStart { .. } => {
                let Some(token) = self.resume_from_state(state) else {
                    return vec![];
                };
                if state.emitted_started {
                    return vec![];
                }
                state.emitted_started = true;
                vec![state
                    .factory
                    .started(token, Some(self.session_title.clone()))]
            }
            OpenCodeEvent::ToolUse { part, .. } => {
                let Some(action) = self.extract_tool_action(&part, state.base_dir.as_deref())
                else {
                    return vec![];
                };
                let empty = Value::Object(Map::new());
                let tool_state = part.get("state").unwrap_or(&empty);
                match tool_state.get("status").and_then(Value::as_str) {
                    Some("completed") => {
                        let exit = tool_state
                            .get("metadata")
                            .and_then(|m| m.get("exit"))
                            .and_then(Value::as_i64);
                        let ok = exit.map(|code| code == 0).unwrap_or(true);
                        let mut detail = action.detail.clone();
                        if let Some(output) = tool_state.get("output").and_then(Value::as_str) {
                            let preview: String = output.chars().take(500).collect();
                            detail.insert("output_preview".into(), preview.into());
                        }
                        if let Some(exit) = exit {
                            detail.insert("exit_code".into(), exit.into());
                        }
                        let action =
                            Action::new(action.id, action.kind, action.title).with_detail(detail);
                        vec![state.factory.action_completed(action, ok)]
                    }
                    Some("error") => {
                        let mut detail = action.detail.clone();
                        if let Some(error) = tool_state.get("error") {
                            if !error.is_null() {
                                detail.insert("error".into(), error.clone());
                            }
                        }
                        let action =
                            Action::new(action.id, action.kind, action.title).with_detail(detail);
                        vec![state.factory.action_completed(action, false)]
                    }
                    _ => vec![state.factory.action_started(action)],
                }
            }
            OpenCodeEvent::Text { part, .. } => {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        match &mut state.last_text {
                            Some(acc) => acc.push_str(text),
                            None => state.last_text = Some(text.to_string()),
                        }
                    }
                }
                vec![]
            }
            OpenCodeEvent::StepFinish { part, .. } => {
                state.saw_step_finish = true;
                if part.get("reason").and_then(Value::as_str) != Some("stop") {
                    return vec![];
                }
                vec![state.factory.completed_ok(
                    state.last_text.clone().unwrap_or_default(),
                    self.resume_from_state(state),
                    None,
                )]
            }
            OpenCodeEvent::Error { error, message, .. } => {
                let raw = message.or(error);
                let text = match raw {
                    Some(Value::String(text)) => text,
                    Some(Value::Object(obj)) => obj
                        .get("data")
                        .and_then(|d| d.get("message"))
                        .or_else(|| obj.get("message"))
                        .or_else(|| obj.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or("opencode error")
                        .to_string(),
                    _ => "opencode error".to_string(),
                };
                vec![state.factory.completed_error(
                    text,
                    state.last_text.clone().unwrap_or_default(),
                    self.resume_from_state(state),
                )]
            }
            OpenCodeEvent::Unknown => vec![],
        }
    }

    fn stream_end_events(
        &self,
        resume: Option<&ResumeToken>,
        found: Option<&ResumeToken>,
        _notes: &mut Notes,
        state: &mut OpenCodeState,
    ) -> Vec<Event> {
        let answer = state.last_text.take().unwrap_or_default();
        match found {
            None => vec![state.factory.completed_error(
                "opencode finished but no session_id was captured",
                answer,
                resume.cloned(),
            )],
            Some(found) if state.saw_step_finish => {
                vec![state.factory.completed_ok(answer, Some(found.clone()), None)]
            }
            Some(found) => vec![state.factory.completed_error(
                "opencode finished without a result event",
                answer,
                Some(found.clone()),
            )],
        }
    }
}

pub fn build_runner(table: &EngineTable) -> Result<std::sync::Arc<dyn Runner>, ConfigError> {
    let engine = EngineId::new(ENGINE);
    let model = opt_str(table, &engine, "model")?;
    let title = model.clone().unwrap_or_else(|| ENGINE.to_string());
    Ok(std::sync::Arc::new(JsonlDriver::new(OpenCodeEngine::new(
        model, title,
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionKind, ActionPhase};
    use serde_json::json;

    fn engine() -> OpenCodeEngine {
        OpenCodeEngine::new(None, "opencode".into())
    }

    fn decode(value: Value) -> OpenCodeEvent {
        opencode::decode_event(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn resume_round_trip() {
        let engine = engine();
        let token = ResumeToken::new(EngineId::new(ENGINE), "ses_abc123");
        let line = engine.format_resume(&token).unwrap();
        assert!(engine.codec().is_line(&line));
        assert_eq!(engine.codec().extract(&line).unwrap(), token);
        // The `run -s` spelling also matches.
        assert_eq!(
            engine.codec().extract("`opencode run -s ses_xyz`").unwrap().value,
            "ses_xyz"
        );
    }

    #[test]
    fn first_step_start_with_session_becomes_started() {
        let engine = engine();
        let mut state = engine.new_state("p", None, None);
        let out = engine.translate(
            decode(json!({"type": "step_start", "sessionID": "ses_a"})),
            &mut state,
            None,
            None,
        );
        assert!(out[0].is_started());
        let again = engine.translate(
            decode(json!({"type": "step_start", "sessionID": "ses_a"})),
            &mut state,
            None,
            None,
        );
        assert!(again.is_empty());
    }

    #[test]
    fn tool_use_lifecycle_produces_start_and_complete() {
        let engine = engine();
        let mut state = engine.new_state("p", None, None);
        let out = engine.translate(
            decode(json!({
                "type": "tool_use", "sessionID": "ses_a",
                "part": {"callID": "c1", "tool": "bash",
                         "state": {"status": "running", "input": {"command": "ls"}}}
            })),
            &mut state,
            None,
            None,
        );
        match &out[0] {
            Event::Action { action, phase, .. } => {
                assert_eq!(action.kind, ActionKind::Command);
                assert_eq!(*phase, ActionPhase::Started);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let out = engine.translate(
            decode(json!({
                "type": "tool_use", "sessionID": "ses_a",
                "part": {"callID": "c1", "tool": "bash",
                         "state": {"status": "completed", "input": {"command": "ls"},
                                   "output": "a.txt", "metadata": {"exit": 0}}}
            })),
            &mut state,
            None,
            None,
        );
        match &out[0] {
            Event::Action { action, ok, .. } => {
                assert_eq!(*ok, Some(true));
                assert_eq!(action.detail["output_preview"], "a.txt");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn step_finish_stop_completes_with_accumulated_text() {
        let engine = engine();
        let mut state = engine.new_state("p", None, None);
        engine.translate(
            decode(json!({"type": "step_start", "sessionID": "ses_a"})),
            &mut state,
            None,
            None,
        );
        engine.translate(
            decode(json!({"type": "text", "part": {"text": "Hello "}})),
            &mut state,
            None,
            None,
        );
        engine.translate(
            decode(json!({"type": "text", "part": {"text": "world"}})),
            &mut state,
            None,
            None,
        );
        let nothing = engine.translate(
            decode(json!({"type": "step_finish", "part": {"reason": "tool-calls"}})),
            &mut state,
            None,
            None,
        );
        assert!(nothing.is_empty());
        let out = engine.translate(
            decode(json!({"type": "step_finish", "part": {"reason": "stop"}})),
            &mut state,
            None,
            None,
        );
        match &out[0] {
            Event::Completed { ok, answer, resume, .. } => {
                assert!(*ok);
                assert_eq!(answer, "Hello world");
                assert_eq!(resume.as_ref().unwrap().value, "ses_a");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn error_event_completes_with_message() {
        let engine = engine();
        let mut state = engine.new_state("p", None, None);
        let out = engine.translate(
            decode(json!({
                "type": "error",
                "error": {"name": "ProviderError", "data": {"message": "quota exceeded"}}
            })),
            &mut state,
            None,
            None,
        );
        match &out[0] {
            Event::Completed { ok, error, .. } => {
                assert!(!ok);
                assert_eq!(error.as_deref(), Some("quota exceeded"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
