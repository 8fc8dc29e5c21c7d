//! Pi engine adapter (`pi --print --mode json`).
//!
//! Pi addresses sessions by file path. New runs mint a session file under the
//! pi agent dir and hand it to `--session`; once the session header reveals
//! the short session id, the token is promoted so resume lines stay compact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::{opt_str, opt_str_list, ConfigError, EngineTable};
use crate::driver::{JsonlDriver, JsonlEngine, Notes};
use crate::model::{Action, ActionKind, EngineId, Event, EventFactory, ResumeToken};
use crate::resume::ResumeCodec;
use crate::runner::{Runner, RunnerError};
use crate::runners::tool_title::{tool_kind_and_title, tool_path};
use crate::schemas::pi::{self, PiEvent};

pub const ENGINE: &str = "pi";

static RESUME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*`?pi\s+--session\s+(?P<token>.+?)`?\s*$").expect("pi resume regex")
});

const SESSION_ID_PREFIX_LEN: usize = 8;

pub struct PiState {
    factory: EventFactory,
    resume: ResumeToken,
    allow_id_promotion: bool,
    started: bool,
    pending: HashMap<String, Action>,
    last_assistant_text: Option<String>,
    last_assistant_error: Option<String>,
    last_usage: Option<Value>,
    base_dir: Option<PathBuf>,
}

pub struct PiEngine {
    engine: EngineId,
    codec: ResumeCodec,
    extra_args: Vec<String>,
    model: Option<String>,
    provider: Option<String>,
    session_title: String,
}

fn looks_like_session_path(token: &str) -> bool {
    !token.is_empty()
        && (token.ends_with(".jsonl")
            || token.contains('/')
            || token.contains('\\')
            || token.starts_with('~'))
}

fn short_session_id(session_id: &str) -> String {
    if let Some((prefix, _)) = session_id.split_once('-') {
        return prefix.to_string();
    }
    session_id.chars().take(SESSION_ID_PREFIX_LEN).collect()
}

fn quote_token(token: &str) -> String {
    let needs_quotes = token.chars().any(char::is_whitespace);
    if !needs_quotes && !token.contains('"') {
        return token.to_string();
    }
    format!("\"{}\"", token.replace('"', "\\\""))
}

fn session_dir_for(cwd: &Path) -> PathBuf {
    let base = std::env::var("PI_CODING_AGENT_DIR")
        .map(PathBuf::from)
        .ok()
        .or_else(|| dirs::home_dir().map(|home| home.join(".pi").join("agent")))
        .unwrap_or_else(|| PathBuf::from(".pi-agent"));
    let cwd_str = cwd.to_string_lossy();
    let safe: String = cwd_str
        .trim_start_matches(['/', '\\'])
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '-' } else { c })
        .collect();
    base.join("sessions").join(format!("--{safe}--"))
}

fn new_session_path(cwd: Option<&Path>) -> String {
    let cwd = cwd
        .map(Path::to_path_buf)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    let dir = session_dir_for(&cwd);
    if let Err(err) = std::fs::create_dir_all(&dir) {
        debug!(error = %err, dir = %dir.display(), "pi.session_dir.create_failed");
    }
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let file = format!("{stamp}_{}.jsonl", Uuid::new_v4().simple());
    dir.join(file).to_string_lossy().into_owned()
}

fn extract_text_blocks(content: &Value) -> Option<String> {
    let items = content.as_array()?;
    let mut parts = Vec::new();
    for item in items {
        if item.get("type").and_then(Value::as_str) != Some("text") {
            continue;
        }
        if let Some(text) = item.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                parts.push(text);
            }
        }
    }
    if parts.is_empty() {
        return None;
    }
    let joined = parts.concat().trim().to_string();
    (!joined.is_empty()).then_some(joined)
}

fn assistant_error(message: &Value) -> Option<String> {
    let stop_reason = message.get("stopReason").and_then(Value::as_str)?;
    if !matches!(stop_reason, "error" | "aborted") {
        return None;
    }
    match message.get("errorMessage").and_then(Value::as_str) {
        Some(error) if !error.is_empty() => Some(error.to_string()),
        _ => Some(format!("pi run {stop_reason}")),
    }
}

fn note_assistant_message(state: &mut PiState, message: &Value) {
    if message.get("role").and_then(Value::as_str) != Some("assistant") {
        return;
    }
    if let Some(content) = message.get("content") {
        if let Some(text) = extract_text_blocks(content) {
            state.last_assistant_text = Some(text);
        }
    }
    if let Some(usage) = message.get("usage") {
        if usage.is_object() {
            state.last_usage = Some(usage.clone());
        }
    }
    if let Some(error) = assistant_error(message) {
        state.last_assistant_error = Some(error);
    }
}

impl PiEngine {
    pub fn new(
        extra_args: Vec<String>,
        model: Option<String>,
        provider: Option<String>,
    ) -> Self {
        let engine = EngineId::new(ENGINE);
        Self {
            codec: ResumeCodec::new(engine.clone(), RESUME_RE.clone()).with_quote_stripping(),
            engine,
            extra_args,
            model,
            provider,
            session_title: ENGINE.to_string(),
        }
    }

    fn started_event(&self, state: &mut PiState) -> Event {
        state.started = true;
        let mut meta = Map::new();
        if let Some(model) = &self.model {
            meta.insert("model".into(), model.clone().into());
        }
        if let Some(provider) = &self.provider {
            meta.insert("provider".into(), provider.clone().into());
        }
        state.factory.started_with_meta(
            state.resume.clone(),
            Some(self.session_title.clone()),
            (!meta.is_empty()).then_some(meta),
        )
    }

    fn maybe_promote_session_id(&self, state: &mut PiState, session_id: Option<&str>) {
        let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
            return;
        };
        if state.started || !state.allow_id_promotion {
            return;
        }
        if !looks_like_session_path(&state.resume.value) {
            return;
        }
        state.resume = ResumeToken::new(self.engine.clone(), short_session_id(session_id));
        state.allow_id_promotion = false;
    }
}

impl JsonlEngine for PiEngine {
    type State = PiState;
    type Decoded = PiEvent;

    fn engine(&self) -> &EngineId {
        &self.engine
    }

    fn codec(&self) -> &ResumeCodec {
        &self.codec
    }

    fn program(&self) -> &str {
        ENGINE
    }

    fn format_resume(&self, token: &ResumeToken) -> Result<String, RunnerError> {
        if token.engine != self.engine {
            return Err(RunnerError::EngineMismatch {
                expected: self.engine.clone(),
                actual: token.engine.clone(),
            });
        }
        Ok(format!("`pi --session {}`", quote_token(&token.value)))
    }

    fn new_state(
        &self,
        _prompt: &str,
        resume: Option<&ResumeToken>,
        cwd: Option<&Path>,
    ) -> PiState {
        let (resume, allow_id_promotion) = match resume {
            Some(token) => (token.clone(), false),
            None => (
                ResumeToken::new(self.engine.clone(), new_session_path(cwd)),
                true,
            ),
        };
        PiState {
            factory: EventFactory::new(self.engine.clone()),
            resume,
            allow_id_promotion,
            started: false,
            pending: HashMap::new(),
            last_assistant_text: None,
            last_assistant_error: None,
            last_usage: None,
            base_dir: cwd.map(Path::to_path_buf),
        }
    }

    fn build_args(
        &self,
        prompt: &str,
        _resume: Option<&ResumeToken>,
        state: &PiState,
    ) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend(["--print", "--mode", "json"].map(String::from));
        if let Some(provider) = &self.provider {
            args.extend(["--provider".to_string(), provider.clone()]);
        }
        if let Some(model) = &self.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        args.extend(["--session".to_string(), state.resume.value.clone()]);
        // A leading dash would otherwise parse as a flag.
        let prompt = if prompt.starts_with('-') {
            format!(" {prompt}")
        } else {
            prompt.to_string()
        };
        args.push(prompt);
        args
    }

    fn stdin_payload(
        &self,
        _prompt: &str,
        _resume: Option<&ResumeToken>,
        _state: &PiState,
    ) -> Option<Vec<u8>> {
        None
    }

    fn env(&self, _state: &PiState) -> Option<Vec<(String, String)>> {
        let mut env: Vec<(String, String)> = std::env::vars().collect();
        for (key, value) in [("NO_COLOR", "1"), ("CI", "1")] {
            if !env.iter().any(|(k, _)| k == key) {
                env.push((key.to_string(), value.to_string()));
            }
        }
        Some(env)
    }

    fn decode_line(&self, line: &[u8]) -> Result<PiEvent, serde_json::Error> {
        pi::decode_event(line)
    }

    fn invalid_json_events(
        &self,
        _line: &str,
        _notes: &mut Notes,
        _state: &mut PiState,
    ) -> Vec<Event> {
        vec![]
    }

    fn translate(
        &self,
        decoded: PiEvent,
        state: &mut PiState,
        _resume: Option<&ResumeToken>,
        _found: Option<&ResumeToken>,
    ) -> Vec<Event> {
        if let PiEvent::Session { id, .. } = &decoded {
            self.maybe_promote_session_id(state, id.as_deref());
            if state.started {
                return vec![];
            }
            return vec![self.started_event(state)];
        }

        let mut out = Vec::new();
        if !state.started {
            out.push(self.started_event(state));
        }

        match decoded {
            PiEvent::ToolExecutionStart {
                tool_call_id,
                tool_name,
                args,
            } => {
                let name = tool_name.unwrap_or_else(|| "tool".to_string());
                let (kind, title) =
                    tool_kind_and_title(&name, &args, state.base_dir.as_deref());
                let mut detail = Map::new();
                detail.insert("tool_name".into(), name.into());
                detail.insert("args".into(), args.clone());
                if kind == ActionKind::FileChange {
                    if let Some(path) = tool_path(&args) {
                        let mut change = Map::new();
                        change.insert("path".into(), path.into());
                        change.insert("kind".into(), "update".into());
                        detail.insert(
                            "changes".into(),
                            Value::Array(vec![Value::Object(change)]),
                        );
                    }
                }
                let action = Action::new(tool_call_id, kind, title).with_detail(detail);
                state.pending.insert(action.id.clone(), action.clone());
                out.push(state.factory.action_started(action));
            }
            PiEvent::ToolExecutionEnd {
                tool_call_id,
                tool_name,
                result,
                is_error,
            } => {
                let action = state.pending.remove(&tool_call_id).unwrap_or_else(|| {
                    Action::new(
                        tool_call_id.clone(),
                        ActionKind::Tool,
                        tool_name.unwrap_or_else(|| "tool".to_string()),
                    )
                });
                let mut detail = action.detail.clone();
                detail.insert("result".into(), result);
                detail.insert("is_error".into(), is_error.into());
                let action =
                    Action::new(action.id, action.kind, action.title).with_detail(detail);
                out.push(state.factory.action_completed(action, !is_error));
            }
            PiEvent::MessageEnd { message } => {
                if let Some(message) = message {
                    note_assistant_message(state, &message);
                }
            }
            PiEvent::AgentEnd { messages } => {
                if let Some(assistant) = messages
                    .iter()
                    .rev()
                    .find(|m| m.get("role").and_then(Value::as_str) == Some("assistant"))
                {
                    note_assistant_message(state, assistant);
                }
                let error = state.last_assistant_error.clone();
                out.push(state.factory.completed(
                    error.is_none(),
                    state.last_assistant_text.clone().unwrap_or_default(),
                    Some(state.resume.clone()),
                    error,
                    state.last_usage.clone(),
                ));
            }
            PiEvent::AutoRetryStart {
                attempt,
                max_attempts,
                error_message,
            } => {
                let attempt = attempt.unwrap_or(1);
                let max = max_attempts.unwrap_or(0);
                let title = match error_message {
                    Some(error) => format!("retrying ({attempt}/{max}): {error}"),
                    None => format!("retrying ({attempt}/{max})"),
                };
                let phase = if attempt <= 1 {
                    crate::model::ActionPhase::Started
                } else {
                    crate::model::ActionPhase::Updated
                };
                let action = Action::new("pi.retry", ActionKind::Note, title);
                out.push(state.factory.action(phase, action));
            }
            _ => {}
        }
        out
    }

    fn exit_error_events(
        &self,
        code: i32,
        _stderr_tail: &str,
        resume: Option<&ResumeToken>,
        found: Option<&ResumeToken>,
        notes: &mut Notes,
        state: &mut PiState,
    ) -> Vec<Event> {
        let message = format!("pi failed (rc={code}).");
        let resume_for_completed = found
            .or(resume)
            .cloned()
            .unwrap_or_else(|| state.resume.clone());
        vec![
            notes.warning(message.clone(), Map::new()),
            state.factory.completed(
                false,
                state.last_assistant_text.clone().unwrap_or_default(),
                Some(resume_for_completed),
                Some(message),
                state.last_usage.clone(),
            ),
        ]
    }

    fn stream_end_events(
        &self,
        resume: Option<&ResumeToken>,
        found: Option<&ResumeToken>,
        _notes: &mut Notes,
        state: &mut PiState,
    ) -> Vec<Event> {
        let resume_for_completed = found
            .or(resume)
            .cloned()
            .unwrap_or_else(|| state.resume.clone());
        vec![state.factory.completed(
            false,
            state.last_assistant_text.clone().unwrap_or_default(),
            Some(resume_for_completed),
            Some("pi finished without an agent_end event".to_string()),
            state.last_usage.clone(),
        )]
    }
}

pub fn build_runner(table: &EngineTable) -> Result<std::sync::Arc<dyn Runner>, ConfigError> {
    let engine = EngineId::new(ENGINE);
    let extra_args = opt_str_list(table, &engine, "extra_args")?.unwrap_or_default();
    let model = opt_str(table, &engine, "model")?;
    let provider = opt_str(table, &engine, "provider")?;
    Ok(std::sync::Arc::new(JsonlDriver::new(PiEngine::new(
        extra_args, model, provider,
    ))))
}
