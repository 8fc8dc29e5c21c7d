//! Claude engine adapter (`claude -p --output-format stream-json`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::config::{opt_bool, opt_str, opt_str_list, ConfigError, EngineTable};
use crate::driver::{JsonlDriver, JsonlEngine, Notes};
use crate::model::{Action, ActionKind, EngineId, Event, EventFactory, ResumeToken};
use crate::resume::ResumeCodec;
use crate::runner::{Runner, RunnerError};
use crate::runners::tool_title::{tool_kind_and_title, tool_path};
use crate::schemas::claude::{self, ContentBlock, StreamMessage};

pub const ENGINE: &str = "claude";

pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &["Bash", "Read", "Edit", "Write"];

static RESUME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*`?claude\s+(?:--resume|-r)\s+(?P<token>[^`\s]+)`?\s*$")
        .expect("claude resume regex")
});

pub struct ClaudeState {
    factory: EventFactory,
    pending: HashMap<String, Action>,
    last_assistant_text: Option<String>,
    note_seq: u32,
    base_dir: Option<PathBuf>,
}

pub struct ClaudeEngine {
    engine: EngineId,
    codec: ResumeCodec,
    claude_cmd: String,
    model: Option<String>,
    allowed_tools: Vec<String>,
    dangerously_skip_permissions: bool,
    use_api_billing: bool,
    session_title: String,
}

impl ClaudeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        claude_cmd: String,
        model: Option<String>,
        allowed_tools: Vec<String>,
        dangerously_skip_permissions: bool,
        use_api_billing: bool,
        session_title: String,
    ) -> Self {
        let engine = EngineId::new(ENGINE);
        Self {
            codec: ResumeCodec::new(engine.clone(), RESUME_RE.clone()),
            engine,
            claude_cmd,
            model,
            allowed_tools,
            dangerously_skip_permissions,
            use_api_billing,
            session_title,
        }
    }

    fn tool_action(
        &self,
        id: String,
        name: &str,
        input: &Value,
        parent_tool_use_id: Option<&str>,
        base: Option<&Path>,
    ) -> Action {
        let (kind, title) = tool_kind_and_title(name, input, base);
        let mut detail = Map::new();
        detail.insert("name".into(), name.into());
        detail.insert("input".into(), input.clone());
        if let Some(parent) = parent_tool_use_id {
            detail.insert("parent_tool_use_id".into(), parent.into());
        }
        if kind == ActionKind::FileChange {
            if let Some(path) = tool_path(input) {
                let mut change = Map::new();
                change.insert("path".into(), path.into());
                change.insert("kind".into(), "update".into());
                detail.insert("changes".into(), Value::Array(vec![Value::Object(change)]));
            }
        }
        Action::new(id, kind, title).with_detail(detail)
    }
}

impl JsonlEngine for ClaudeEngine {
    type State = ClaudeState;
    type Decoded = StreamMessage;

    fn engine(&self) -> &EngineId {
        &self.engine
    }

    fn codec(&self) -> &ResumeCodec {
        &self.codec
    }

    fn program(&self) -> &str {
        &self.claude_cmd
    }

    fn format_resume(&self, token: &ResumeToken) -> Result<String, RunnerError> {
        if token.engine != self.engine {
            return Err(RunnerError::EngineMismatch {
                expected: self.engine.clone(),
                actual: token.engine.clone(),
            });
        }
        Ok(format!("`claude --resume {}`", token.value))
    }

    fn new_state(
        &self,
        _prompt: &str,
        _resume: Option<&ResumeToken>,
        cwd: Option<&Path>,
    ) -> ClaudeState {
        ClaudeState {
            factory: EventFactory::new(self.engine.clone()),
            pending: HashMap::new(),
            last_assistant_text: None,
            note_seq: 0,
            base_dir: cwd.map(Path::to_path_buf),
        }
    }

    fn build_args(
        &self,
        prompt: &str,
        resume: Option<&ResumeToken>,
        _state: &ClaudeState,
    ) -> Vec<String> {
        let mut args: Vec<String> =
            ["-p", "--output-format", "stream-json", "--verbose"].map(String::from).into();
        if let Some(token) = resume {
            args.extend(["--resume".to_string(), token.value.clone()]);
        }
        if let Some(model) = &self.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if !self.allowed_tools.is_empty() {
            args.extend(["--allowedTools".to_string(), self.allowed_tools.join(",")]);
        }
        if self.dangerously_skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.push("--".to_string());
        args.push(prompt.to_string());
        args
    }

    fn stdin_payload(
        &self,
        _prompt: &str,
        _resume: Option<&ResumeToken>,
        _state: &ClaudeState,
    ) -> Option<Vec<u8>> {
        None
    }

    /// Without API billing the subscription login must be used, so the API
    /// key is withheld from the child.
    fn env(&self, _state: &ClaudeState) -> Option<Vec<(String, String)>> {
        if self.use_api_billing {
            return None;
        }
        Some(
            std::env::vars()
                .filter(|(key, _)| key != "ANTHROPIC_API_KEY")
                .collect(),
        )
    }

    fn decode_line(&self, line: &[u8]) -> Result<StreamMessage, serde_json::Error> {
        claude::decode_stream_line(line)
    }

    fn invalid_json_events(
        &self,
        _line: &str,
        _notes: &mut Notes,
        _state: &mut ClaudeState,
    ) -> Vec<Event> {
        // Tolerated: claude interleaves non-protocol diagnostics on stdout.
        vec![]
    }

    fn translate(
        &self,
        decoded: StreamMessage,
        state: &mut ClaudeState,
        _resume: Option<&ResumeToken>,
        _found: Option<&ResumeToken>,
    ) -> Vec<Event> {
        match decoded {
            StreamMessage::System(sys) => {
                if sys.subtype != "init" {
                    return vec![];
                }
                let Some(session_id) = sys.session_id.filter(|s| !s.is_empty()) else {
                    return vec![];
                };
                let mut meta = Map::new();
                if let Some(cwd) = sys.cwd {
                    meta.insert("cwd".into(), cwd.into());
                }
                if !sys.tools.is_empty() {
                    meta.insert("tools".into(), sys.tools.into());
                }
                if let Some(mode) = sys.permission_mode {
                    meta.insert("permissionMode".into(), mode.into());
                }
                let title = sys
                    .model
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| self.session_title.clone());
                let token = ResumeToken::new(self.engine.clone(), session_id);
                vec![state.factory.started_with_meta(
                    token,
                    Some(title),
                    (!meta.is_empty()).then_some(meta),
                )]
            }
            StreamMessage::Assistant(evt) => {
                let parent = evt.parent_tool_use_id.as_deref();
                let mut out = Vec::new();
                for block in evt.message.content {
                    match block {
                        ContentBlock::ToolUse { id, name, input } => {
                            let action =
                                self.tool_action(id, &name, &input, parent, state.base_dir.as_deref());
                            state.pending.insert(action.id.clone(), action.clone());
                            out.push(state.factory.action_started(action));
                        }
                        ContentBlock::Thinking { thinking, signature } => {
                            if thinking.is_empty() {
                                continue;
                            }
                            state.note_seq += 1;
                            let id = format!("claude.thinking.{}", state.note_seq);
                            let mut detail = Map::new();
                            if let Some(parent) = parent {
                                detail.insert("parent_tool_use_id".into(), parent.into());
                            }
                            if let Some(signature) = signature {
                                detail.insert("signature".into(), signature.into());
                            }
                            let action =
                                Action::new(id, ActionKind::Note, thinking).with_detail(detail);
                            out.push(state.factory.action_completed(action, true));
                        }
                        ContentBlock::Text { text } => {
                            if !text.is_empty() {
                                state.last_assistant_text = Some(text);
                            }
                        }
                        ContentBlock::ToolResult { .. } | ContentBlock::Unknown => {}
                    }
                }
                out
            }
            StreamMessage::User(evt) => {
                let mut out = Vec::new();
                for block in evt.message.content {
                    let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    else {
                        continue;
                    };
                    let action = state.pending.remove(&tool_use_id).unwrap_or_else(|| {
                        Action::new(tool_use_id.clone(), ActionKind::Tool, "tool result")
                    });
                    let preview = content.map(|c| c.to_text()).unwrap_or_default();
                    let mut detail = action.detail.clone();
                    detail.insert("tool_use_id".into(), tool_use_id.into());
                    detail.insert("result_len".into(), (preview.len() as u64).into());
                    detail.insert("result_preview".into(), preview.into());
                    detail.insert("is_error".into(), is_error.into());
                    let action = Action::new(action.id, action.kind, action.title)
                        .with_detail(detail);
                    out.push(state.factory.action_completed(action, !is_error));
                }
                out
            }
            StreamMessage::Result(result) => {
                let ok = !result.is_error;
                let mut answer = result.result.clone().unwrap_or_default();
                if ok && answer.is_empty() {
                    if let Some(text) = &state.last_assistant_text {
                        answer = text.clone();
                    }
                }
                let error = (!ok).then(|| result.error_message());
                let mut usage = Map::new();
                if let Some(cost) = result.total_cost_usd {
                    usage.insert("total_cost_usd".into(), cost.into());
                }
                if let Some(ms) = result.duration_ms {
                    usage.insert("duration_ms".into(), ms.into());
                }
                if let Some(turns) = result.num_turns {
                    usage.insert("num_turns".into(), turns.into());
                }
                if let Some(raw) = result.usage.clone() {
                    usage.insert("usage".into(), raw);
                }
                let token = ResumeToken::new(self.engine.clone(), result.session_id);
                vec![state.factory.completed(
                    ok,
                    answer,
                    Some(token),
                    error,
                    (!usage.is_empty()).then(|| Value::Object(usage)),
                )]
            }
            StreamMessage::Unknown => vec![],
        }
    }

    fn stream_end_events(
        &self,
        resume: Option<&ResumeToken>,
        found: Option<&ResumeToken>,
        _notes: &mut Notes,
        state: &mut ClaudeState,
    ) -> Vec<Event> {
        match found {
            None => vec![state.factory.completed_error(
                "claude finished but no session_id was captured",
                String::new(),
                resume.cloned(),
            )],
            Some(found) => vec![state.factory.completed_error(
                "claude finished without a result event",
                state.last_assistant_text.take().unwrap_or_default(),
                Some(found.clone()),
            )],
        }
    }
}

pub fn build_runner(table: &EngineTable) -> Result<std::sync::Arc<dyn Runner>, ConfigError> {
    let engine = EngineId::new(ENGINE);
    let claude_cmd = opt_str(table, &engine, "command")?
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| ENGINE.to_string());
    let model = opt_str(table, &engine, "model")?;
    let allowed_tools = opt_str_list(table, &engine, "allowed_tools")?
        .unwrap_or_else(|| DEFAULT_ALLOWED_TOOLS.iter().map(|s| s.to_string()).collect());
    let dangerously_skip_permissions =
        opt_bool(table, &engine, "dangerously_skip_permissions")?.unwrap_or(false);
    let use_api_billing = opt_bool(table, &engine, "use_api_billing")?.unwrap_or(false);
    let title = model.clone().unwrap_or_else(|| ENGINE.to_string());
    Ok(std::sync::Arc::new(JsonlDriver::new(ClaudeEngine::new(
        claude_cmd,
        model,
        allowed_tools,
        dangerously_skip_permissions,
        use_api_billing,
        title,
    ))))
}
