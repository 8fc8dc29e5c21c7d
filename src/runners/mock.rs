//! In-process mock engine.
//!
//! Emits a `Started` with a deterministic or minted token, replays a scripted
//! event list, and completes. Used by the bridge and scheduler tests and as a
//! wiring smoke engine (`/mock ping`).

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{opt_str, ConfigError, EngineTable};
use crate::model::{ActionPhase, EngineId, Event, ResumeToken};
use crate::resume::ResumeCodec;
use crate::runner::{EventSender, RunRequest, Runner, RunnerError, SessionLocks};

pub const ENGINE: &str = "mock";

fn mock_codec(engine: &EngineId) -> ResumeCodec {
    let pattern = format!(
        r"(?im)^\s*`?{}\s+resume\s+(?P<token>[^`\s]+)`?\s*$",
        regex::escape(engine.as_str())
    );
    let regex = Regex::new(&pattern).expect("mock resume regex");
    ResumeCodec::new(engine.clone(), regex)
}

/// Fill in a default `ok` on scripted completed-phase actions so test scripts
/// stay terse.
fn normalize_scripted(event: Event) -> Event {
    match event {
        Event::Action {
            engine,
            action,
            phase: ActionPhase::Completed,
            ok: None,
            message,
            level,
        } => Event::Action {
            engine,
            action,
            phase: ActionPhase::Completed,
            ok: Some(true),
            message,
            level,
        },
        other => other,
    }
}

pub struct MockRunner {
    engine: EngineId,
    codec: ResumeCodec,
    events: Vec<Event>,
    answer: String,
    resume_value: Option<String>,
    title: String,
    locks: SessionLocks,
}

impl MockRunner {
    pub fn new(engine: EngineId) -> Self {
        let title = engine.as_str().to_string();
        Self {
            codec: mock_codec(&engine),
            engine,
            events: Vec::new(),
            answer: String::new(),
            resume_value: None,
            title,
            locks: SessionLocks::new(),
        }
    }

    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = answer.into();
        self
    }

    pub fn with_resume_value(mut self, value: impl Into<String>) -> Self {
        self.resume_value = Some(value.into());
        self
    }

    fn token_for(&self, resume: Option<&ResumeToken>) -> ResumeToken {
        let value = resume
            .map(|t| t.value.clone())
            .or_else(|| self.resume_value.clone())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        ResumeToken::new(self.engine.clone(), value)
    }
}

#[async_trait]
impl Runner for MockRunner {
    fn engine(&self) -> &EngineId {
        &self.engine
    }

    fn format_resume(&self, token: &ResumeToken) -> Result<String, RunnerError> {
        if token.engine != self.engine {
            return Err(RunnerError::EngineMismatch {
                expected: self.engine.clone(),
                actual: token.engine.clone(),
            });
        }
        Ok(format!("`{} resume {}`", self.engine, token.value))
    }

    fn extract_resume(&self, text: &str) -> Option<ResumeToken> {
        self.codec.extract(text)
    }

    fn is_resume_line(&self, line: &str) -> bool {
        self.codec.is_line(line)
    }

    async fn run(&self, req: RunRequest, events: EventSender) {
        let token = self.token_for(req.resume.as_ref());
        let lock = self.locks.lock_for(&token);
        let _guard = tokio::select! {
            _ = req.cancel.cancelled() => return,
            guard = lock.lock_owned() => guard,
        };

        let started = Event::Started {
            engine: self.engine.clone(),
            resume: token.clone(),
            title: Some(self.title.clone()),
            meta: None,
        };
        if events.send(started).await.is_err() {
            return;
        }

        for event in &self.events {
            if req.cancel.is_cancelled() {
                let cancelled = Event::Completed {
                    engine: self.engine.clone(),
                    ok: false,
                    answer: String::new(),
                    resume: Some(token),
                    error: Some("cancelled".to_string()),
                    usage: None,
                };
                let _ = events.send(cancelled).await;
                return;
            }
            if events.send(normalize_scripted(event.clone())).await.is_err() {
                return;
            }
            tokio::task::yield_now().await;
        }

        let completed = Event::Completed {
            engine: self.engine.clone(),
            ok: true,
            answer: self.answer.clone(),
            resume: Some(token),
            error: None,
            usage: None,
        };
        let _ = events.send(completed).await;
    }
}

/// Explicit step script for concurrency tests: emit, pause, block on an
/// external gate, or return early.
#[derive(Clone)]
pub enum ScriptStep {
    Emit(Event),
    Sleep(Duration),
    Wait(watch::Receiver<bool>),
    Return(String),
}

pub struct ScriptRunner {
    engine: EngineId,
    codec: ResumeCodec,
    script: Vec<ScriptStep>,
    resume_value: Option<String>,
    title: String,
    locks: SessionLocks,
    /// Prompt/resume pairs observed by `run`, for test assertions.
    pub calls: Mutex<Vec<(String, Option<ResumeToken>)>>,
}

impl ScriptRunner {
    pub fn new(engine: EngineId, script: Vec<ScriptStep>) -> Self {
        let title = engine.as_str().to_string();
        Self {
            codec: mock_codec(&engine),
            engine,
            script,
            resume_value: None,
            title,
            locks: SessionLocks::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_resume_value(mut self, value: impl Into<String>) -> Self {
        self.resume_value = Some(value.into());
        self
    }

    fn token_for(&self, resume: Option<&ResumeToken>) -> ResumeToken {
        let value = resume
            .map(|t| t.value.clone())
            .or_else(|| self.resume_value.clone())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        ResumeToken::new(self.engine.clone(), value)
    }
}

#[async_trait]
impl Runner for ScriptRunner {
    fn engine(&self) -> &EngineId {
        &self.engine
    }

    fn format_resume(&self, token: &ResumeToken) -> Result<String, RunnerError> {
        if token.engine != self.engine {
            return Err(RunnerError::EngineMismatch {
                expected: self.engine.clone(),
                actual: token.engine.clone(),
            });
        }
        Ok(format!("`{} resume {}`", self.engine, token.value))
    }

    fn extract_resume(&self, text: &str) -> Option<ResumeToken> {
        self.codec.extract(text)
    }

    fn is_resume_line(&self, line: &str) -> bool {
        self.codec.is_line(line)
    }

    async fn run(&self, req: RunRequest, events: EventSender) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((req.prompt.clone(), req.resume.clone()));

        let token = self.token_for(req.resume.as_ref());
        let lock = self.locks.lock_for(&token);
        let _guard = tokio::select! {
            _ = req.cancel.cancelled() => return,
            guard = lock.lock_owned() => guard,
        };

        let started = Event::Started {
            engine: self.engine.clone(),
            resume: token.clone(),
            title: Some(self.title.clone()),
            meta: None,
        };
        if events.send(started).await.is_err() {
            return;
        }

        let cancelled_completed = |token: ResumeToken| Event::Completed {
            engine: self.engine.clone(),
            ok: false,
            answer: String::new(),
            resume: Some(token),
            error: Some("cancelled".to_string()),
            usage: None,
        };

        for step in &self.script {
            if req.cancel.is_cancelled() {
                let _ = events.send(cancelled_completed(token)).await;
                return;
            }
            match step {
                ScriptStep::Emit(event) => {
                    if events.send(normalize_scripted(event.clone())).await.is_err() {
                        return;
                    }
                    tokio::task::yield_now().await;
                }
                ScriptStep::Sleep(duration) => {
                    tokio::select! {
                        _ = req.cancel.cancelled() => {
                            let _ = events.send(cancelled_completed(token)).await;
                            return;
                        }
                        _ = tokio::time::sleep(*duration) => {}
                    }
                }
                ScriptStep::Wait(gate) => {
                    let mut gate = gate.clone();
                    let wait_fut = async {
                        let _ = gate.wait_for(|open| *open).await;
                    };
                    tokio::select! {
                        _ = req.cancel.cancelled() => {
                            let _ = events.send(cancelled_completed(token)).await;
                            return;
                        }
                        _ = wait_fut => {}
                    }
                }
                ScriptStep::Return(answer) => {
                    let completed = Event::Completed {
                        engine: self.engine.clone(),
                        ok: true,
                        answer: answer.clone(),
                        resume: Some(token),
                        error: None,
                        usage: None,
                    };
                    let _ = events.send(completed).await;
                    return;
                }
            }
        }

        let completed = Event::Completed {
            engine: self.engine.clone(),
            ok: true,
            answer: String::new(),
            resume: Some(token),
            error: None,
            usage: None,
        };
        let _ = events.send(completed).await;
    }
}

pub fn build_runner(table: &EngineTable) -> Result<std::sync::Arc<dyn Runner>, ConfigError> {
    let engine = EngineId::new(ENGINE);
    let answer = opt_str(table, &engine, "answer")?.unwrap_or_else(|| "pong".to_string());
    let mut runner = MockRunner::new(engine.clone()).with_answer(answer);
    if let Some(value) = opt_str(table, &engine, "resume_value")? {
        runner = runner.with_resume_value(value);
    }
    Ok(std::sync::Arc::new(runner))
}
