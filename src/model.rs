//! Normalized event model shared by every engine adapter.
//!
//! Adapters translate their CLI's wire events into this small vocabulary:
//! one `Started` per run, any number of `Action` events keyed by a stable
//! per-run action id, and exactly one terminal `Completed`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of an engine backend (`"codex"`, `"claude"`, ...).
///
/// Not a closed set: adapters are discovered at startup, so this stays an
/// opaque lowercase string rather than an enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineId(String);

impl EngineId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EngineId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Names an engine-side conversation. Only trusted after the owning adapter
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken {
    pub engine: EngineId,
    pub value: String,
}

impl ResumeToken {
    pub fn new(engine: EngineId, value: impl Into<String>) -> Self {
        Self {
            engine,
            value: value.into(),
        }
    }

    /// Key used for scheduling and per-thread locking.
    pub fn thread_key(&self) -> String {
        format!("{}:{}", self.engine, self.value)
    }
}

/// Phase of an action within a run. Ordered: started < updated < completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionPhase {
    Started,
    Updated,
    Completed,
}

impl ActionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionPhase::Started => "started",
            ActionPhase::Updated => "updated",
            ActionPhase::Completed => "completed",
        }
    }
}

/// Kind of work an action represents. Unknown kinds render as `Note`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Command,
    Tool,
    FileChange,
    WebSearch,
    Subagent,
    Turn,
    Warning,
    Telemetry,
    Note,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Command => "command",
            ActionKind::Tool => "tool",
            ActionKind::FileChange => "file_change",
            ActionKind::WebSearch => "web_search",
            ActionKind::Subagent => "subagent",
            ActionKind::Turn => "turn",
            ActionKind::Warning => "warning",
            ActionKind::Telemetry => "telemetry",
            ActionKind::Note => "note",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "command" => ActionKind::Command,
            "tool" => ActionKind::Tool,
            "file_change" => ActionKind::FileChange,
            "web_search" => ActionKind::WebSearch,
            "subagent" => ActionKind::Subagent,
            "turn" => ActionKind::Turn,
            "warning" => ActionKind::Warning,
            "telemetry" => ActionKind::Telemetry,
            _ => ActionKind::Note,
        }
    }
}

/// Severity attached to action events that carry a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// One unit of engine work. Immutable value; `id` is unique within a run and
/// stable across every event referring to the same underlying action.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub id: String,
    pub kind: ActionKind,
    pub title: String,
    pub detail: Map<String, Value>,
}

impl Action {
    pub fn new(id: impl Into<String>, kind: ActionKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            detail: Map::new(),
        }
    }

    pub fn with_detail(mut self, detail: Map<String, Value>) -> Self {
        self.detail = detail;
        self
    }
}

/// Normalized run event. See module docs for the per-run invariants.
#[derive(Debug, Clone)]
pub enum Event {
    Started {
        engine: EngineId,
        resume: ResumeToken,
        title: Option<String>,
        meta: Option<Map<String, Value>>,
    },
    Action {
        engine: EngineId,
        action: Action,
        phase: ActionPhase,
        ok: Option<bool>,
        message: Option<String>,
        level: Option<ActionLevel>,
    },
    Completed {
        engine: EngineId,
        ok: bool,
        answer: String,
        resume: Option<ResumeToken>,
        error: Option<String>,
        usage: Option<Value>,
    },
}

impl Event {
    pub fn engine(&self) -> &EngineId {
        match self {
            Event::Started { engine, .. }
            | Event::Action { engine, .. }
            | Event::Completed { engine, .. } => engine,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Event::Started { .. })
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Event::Completed { .. })
    }
}

/// Per-engine constructor for normalized events. Keeps adapter translate
/// functions free of the `engine` plumbing.
#[derive(Debug, Clone)]
pub struct EventFactory {
    engine: EngineId,
}

impl EventFactory {
    pub fn new(engine: EngineId) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &EngineId {
        &self.engine
    }

    pub fn started(&self, resume: ResumeToken, title: Option<String>) -> Event {
        self.started_with_meta(resume, title, None)
    }

    pub fn started_with_meta(
        &self,
        resume: ResumeToken,
        title: Option<String>,
        meta: Option<Map<String, Value>>,
    ) -> Event {
        Event::Started {
            engine: self.engine.clone(),
            resume,
            title,
            meta,
        }
    }

    pub fn action(&self, phase: ActionPhase, action: Action) -> Event {
        Event::Action {
            engine: self.engine.clone(),
            action,
            phase,
            ok: None,
            message: None,
            level: None,
        }
    }

    pub fn action_started(&self, action: Action) -> Event {
        self.action(ActionPhase::Started, action)
    }

    pub fn action_completed(&self, action: Action, ok: bool) -> Event {
        Event::Action {
            engine: self.engine.clone(),
            action,
            phase: ActionPhase::Completed,
            ok: Some(ok),
            message: None,
            level: None,
        }
    }

    /// A warning surfaced as an already-completed action so it shows up in
    /// progress without ever going through a started phase.
    pub fn warning(&self, id: String, message: &str, detail: Map<String, Value>) -> Event {
        Event::Action {
            engine: self.engine.clone(),
            action: Action {
                id,
                kind: ActionKind::Warning,
                title: message.to_string(),
                detail,
            },
            phase: ActionPhase::Completed,
            ok: Some(false),
            message: Some(message.to_string()),
            level: Some(ActionLevel::Warning),
        }
    }

    pub fn completed(
        &self,
        ok: bool,
        answer: String,
        resume: Option<ResumeToken>,
        error: Option<String>,
        usage: Option<Value>,
    ) -> Event {
        Event::Completed {
            engine: self.engine.clone(),
            ok,
            answer,
            resume,
            error,
            usage,
        }
    }

    pub fn completed_ok(
        &self,
        answer: String,
        resume: Option<ResumeToken>,
        usage: Option<Value>,
    ) -> Event {
        self.completed(true, answer, resume, None, usage)
    }

    pub fn completed_error(
        &self,
        error: impl Into<String>,
        answer: String,
        resume: Option<ResumeToken>,
    ) -> Event {
        self.completed(false, answer, resume, Some(error.into()), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_key_joins_engine_and_value() {
        let token = ResumeToken::new(EngineId::new("codex"), "abc-123");
        assert_eq!(token.thread_key(), "codex:abc-123");
    }

    #[test]
    fn action_phases_are_ordered() {
        assert!(ActionPhase::Started < ActionPhase::Updated);
        assert!(ActionPhase::Updated < ActionPhase::Completed);
    }

    #[test]
    fn unknown_action_kind_parses_as_note() {
        assert_eq!(ActionKind::parse("frobnicate"), ActionKind::Note);
        assert_eq!(ActionKind::parse("web_search"), ActionKind::WebSearch);
    }

    #[test]
    fn factory_stamps_engine_on_events() {
        let factory = EventFactory::new(EngineId::new("mock"));
        let token = ResumeToken::new(EngineId::new("mock"), "t1");
        let evt = factory.started(token, Some("Mock".into()));
        assert_eq!(evt.engine().as_str(), "mock");
        assert!(evt.is_started());
    }

    #[test]
    fn factory_warning_is_completed_and_not_ok() {
        let factory = EventFactory::new(EngineId::new("codex"));
        let evt = factory.warning("codex.note.1".into(), "boom", Map::new());
        match evt {
            Event::Action {
                phase, ok, level, ..
            } => {
                assert_eq!(phase, ActionPhase::Completed);
                assert_eq!(ok, Some(false));
                assert!(matches!(level, Some(ActionLevel::Warning)));
            }
            other => panic!("expected action event, got {other:?}"),
        }
    }
}
