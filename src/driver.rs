//! Shared JSONL subprocess driver.
//!
//! Every JSONL engine adapter parameterizes this driver with its own argv,
//! wire decoder, and translation; the driver owns the rest of the contract:
//! spawning the CLI in its own process group, streaming stdout lines,
//! enforcing the one-`Started`/one-`Completed` protocol, draining stderr into
//! a bounded tail, and converting every way a run can end into a terminal
//! `Completed` event.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Map;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::model::{EngineId, Event, EventFactory, ResumeToken};
use crate::resume::ResumeCodec;
use crate::runner::{
    EventSender, RunRequest, Runner, RunnerError, SessionGuard, SessionLocks,
};

/// Stderr is drained into a ring buffer of at most this many bytes; the tail
/// feeds synthetic error completions.
pub const STDERR_TAIL_BYTES: usize = 4096;

/// Grace period between SIGTERM and SIGKILL when shutting a child down.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Sequence counter for synthetic warning actions emitted by the driver and
/// its adapter hooks (invalid lines, process errors, pre-init notices).
pub struct Notes {
    factory: EventFactory,
    tag: String,
    seq: u64,
}

impl Notes {
    pub fn new(engine: EngineId) -> Self {
        let tag = engine.as_str().to_string();
        Self {
            factory: EventFactory::new(engine),
            tag,
            seq: 0,
        }
    }

    pub fn factory(&self) -> &EventFactory {
        &self.factory
    }

    pub fn warning(
        &mut self,
        message: impl Into<String>,
        detail: Map<String, serde_json::Value>,
    ) -> Event {
        self.seq += 1;
        let id = format!("{}.note.{}", self.tag, self.seq);
        let message: String = message.into();
        self.factory.warning(id, &message, detail)
    }
}

/// Engine-specific half of the JSONL driver.
///
/// Implementations supply argv construction, the typed wire decoder, and the
/// translation to normalized events; everything else has a default that
/// mirrors the shared completion policies.
pub trait JsonlEngine: Send + Sync + 'static {
    type State: Send + 'static;
    type Decoded: Send;

    fn engine(&self) -> &EngineId;
    fn codec(&self) -> &ResumeCodec;
    fn program(&self) -> &str;
    fn format_resume(&self, token: &ResumeToken) -> Result<String, RunnerError>;

    fn new_state(
        &self,
        prompt: &str,
        resume: Option<&ResumeToken>,
        cwd: Option<&Path>,
    ) -> Self::State;

    fn build_args(
        &self,
        prompt: &str,
        resume: Option<&ResumeToken>,
        state: &Self::State,
    ) -> Vec<String>;

    /// Bytes written to the child's stdin before it is closed. The default
    /// sends the prompt, which sidesteps argv-escaping hazards for CLIs that
    /// read the prompt from stdin.
    fn stdin_payload(
        &self,
        prompt: &str,
        _resume: Option<&ResumeToken>,
        _state: &Self::State,
    ) -> Option<Vec<u8>> {
        Some(prompt.as_bytes().to_vec())
    }

    /// Full replacement environment for the child, or `None` to inherit.
    fn env(&self, _state: &Self::State) -> Option<Vec<(String, String)>> {
        None
    }

    fn decode_line(&self, line: &[u8]) -> Result<Self::Decoded, serde_json::Error>;

    fn translate(
        &self,
        decoded: Self::Decoded,
        state: &mut Self::State,
        resume: Option<&ResumeToken>,
        found: Option<&ResumeToken>,
    ) -> Vec<Event>;

    /// Events for a stdout line that failed to decode.
    fn invalid_json_events(
        &self,
        line: &str,
        notes: &mut Notes,
        _state: &mut Self::State,
    ) -> Vec<Event> {
        let mut detail = Map::new();
        detail.insert("line".into(), line.into());
        let message = format!("invalid JSON from {}; ignoring line", self.engine());
        vec![notes.warning(message, detail)]
    }

    /// Events for a non-zero exit without an observed `Completed`.
    fn exit_error_events(
        &self,
        code: i32,
        stderr_tail: &str,
        resume: Option<&ResumeToken>,
        found: Option<&ResumeToken>,
        notes: &mut Notes,
        _state: &mut Self::State,
    ) -> Vec<Event> {
        let message = format!("{} failed (rc={code}).", self.engine());
        let error = if stderr_tail.trim().is_empty() {
            message.clone()
        } else {
            format!("{message}\n{}", stderr_tail.trim_end())
        };
        let resume_for_completed = found.or(resume).cloned();
        vec![
            notes.warning(message, Map::new()),
            notes
                .factory()
                .completed_error(error, String::new(), resume_for_completed),
        ]
    }

    /// Events for a stream that ended without an observed `Completed`.
    fn stream_end_events(
        &self,
        resume: Option<&ResumeToken>,
        found: Option<&ResumeToken>,
        notes: &mut Notes,
        _state: &mut Self::State,
    ) -> Vec<Event> {
        let message = format!("{} finished without a result event", self.engine());
        let resume_for_completed = found.or(resume).cloned();
        vec![notes
            .factory()
            .completed_error(message, String::new(), resume_for_completed)]
    }
}

/// JSONL driver wrapping an engine plus the per-thread lock registry.
pub struct JsonlDriver<E: JsonlEngine> {
    engine: E,
    locks: SessionLocks,
}

impl<E: JsonlEngine> JsonlDriver<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            locks: SessionLocks::new(),
        }
    }

    pub fn inner(&self) -> &E {
        &self.engine
    }
}

enum SendOutcome {
    Sent,
    Stopped,
}

async fn send_event(
    events: &EventSender,
    cancel: &tokio_util::sync::CancellationToken,
    evt: Event,
) -> SendOutcome {
    tokio::select! {
        _ = cancel.cancelled() => SendOutcome::Stopped,
        sent = events.send(evt) => match sent {
            Ok(()) => SendOutcome::Sent,
            // Receiver gone: the consumer abandoned the run.
            Err(_) => SendOutcome::Stopped,
        },
    }
}

#[async_trait]
impl<E: JsonlEngine> Runner for JsonlDriver<E> {
    fn engine(&self) -> &EngineId {
        self.engine.engine()
    }

    fn format_resume(&self, token: &ResumeToken) -> Result<String, RunnerError> {
        self.engine.format_resume(token)
    }

    fn extract_resume(&self, text: &str) -> Option<ResumeToken> {
        self.engine.codec().extract(text)
    }

    fn is_resume_line(&self, line: &str) -> bool {
        self.engine.codec().is_line(line)
    }

    async fn run(&self, req: RunRequest, events: EventSender) {
        let RunRequest {
            prompt,
            resume,
            cwd,
            cancel,
        } = req;
        let engine_id = self.engine.engine().clone();
        let mut notes = Notes::new(engine_id.clone());

        if let Some(token) = &resume {
            if token.engine != engine_id {
                let error = RunnerError::EngineMismatch {
                    expected: engine_id.clone(),
                    actual: token.engine.clone(),
                };
                let evt = notes
                    .factory()
                    .completed_error(error.to_string(), String::new(), None);
                let _ = events.send(evt).await;
                return;
            }
        }

        let mut state = self.engine.new_state(&prompt, resume.as_ref(), cwd.as_deref());

        // Resumed runs serialize against their thread before the CLI spawns;
        // new sessions acquire the lock the moment the thread id is learned.
        let mut guard: Option<SessionGuard> = None;
        if let Some(token) = &resume {
            let lock = self.locks.lock_for(token);
            tokio::select! {
                _ = cancel.cancelled() => {
                    let evt = notes.factory().completed_error(
                        "cancelled",
                        String::new(),
                        resume.clone(),
                    );
                    let _ = events.send(evt).await;
                    return;
                }
                acquired = lock.lock_owned() => guard = Some(acquired),
            }
        }

        let args = self.engine.build_args(&prompt, resume.as_ref(), &state);
        let payload = self.engine.stdin_payload(&prompt, resume.as_ref(), &state);

        info!(
            engine = %engine_id,
            resume = resume.as_ref().map(|t| t.value.as_str()),
            prompt_len = prompt.len(),
            "runner.start"
        );

        let mut cmd = Command::new(self.engine.program());
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        if let Some(env) = self.engine.env(&state) {
            cmd.env_clear().envs(env);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                let error = format!("failed to spawn {}: {err}", self.engine.program());
                warn!(engine = %engine_id, error = %error, "subprocess.spawn.failed");
                let evt = notes
                    .factory()
                    .completed_error(error, String::new(), resume.clone());
                let _ = events.send(evt).await;
                return;
            }
        };
        let pid = child.id();
        debug!(engine = %engine_id, pid, program = self.engine.program(), "subprocess.spawn");

        if let Some(mut stdin) = child.stdin.take() {
            if let Some(payload) = payload {
                if let Err(err) = stdin.write_all(&payload).await {
                    debug!(engine = %engine_id, error = %err, "subprocess.stdin.write_failed");
                }
                let _ = stdin.shutdown().await;
            }
            drop(stdin);
        }

        let stderr_tail = Arc::new(Mutex::new(StderrTail::new(STDERR_TAIL_BYTES)));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&stderr_tail);
            let engine = engine_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(engine = %engine, line = %line, "subprocess.stderr");
                    tail.lock().unwrap_or_else(|e| e.into_inner()).push(line);
                }
            })
        });

        let Some(stdout) = child.stdout.take() else {
            shutdown_child(&mut child).await;
            let evt = notes.factory().completed_error(
                format!("{engine_id} failed to open subprocess pipes"),
                String::new(),
                resume.clone(),
            );
            let _ = events.send(evt).await;
            return;
        };
        let mut lines = BufReader::new(stdout).lines();

        let mut found: Option<ResumeToken> = None;
        let mut emitted_started = false;
        let mut emitted_completed = false;
        let mut stopped = false;

        'read: loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => {
                    stopped = true;
                    break 'read;
                }
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break 'read,
                Err(err) => {
                    warn!(engine = %engine_id, pid, error = %err, "subprocess.stdout.read_failed");
                    break 'read;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let out = match self.engine.decode_line(trimmed.as_bytes()) {
                Ok(decoded) => {
                    self.engine
                        .translate(decoded, &mut state, resume.as_ref(), found.as_ref())
                }
                Err(err) => {
                    debug!(engine = %engine_id, pid, error = %err, line = %trimmed, "jsonl.decode.invalid");
                    self.engine.invalid_json_events(trimmed, &mut notes, &mut state)
                }
            };

            for evt in out {
                match &evt {
                    Event::Started { resume: token, .. } => {
                        if emitted_started {
                            warn!(
                                engine = %engine_id,
                                pid,
                                resume = %token.value,
                                "runner.started.duplicate_dropped"
                            );
                            continue;
                        }
                        if let Some(expected) = &resume {
                            if token != expected {
                                warn!(
                                    engine = %engine_id,
                                    pid,
                                    resume = %token.value,
                                    expected = %expected.value,
                                    "runner.started.mismatch_dropped"
                                );
                                continue;
                            }
                        }
                        if guard.is_none() {
                            let lock = self.locks.lock_for(token);
                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    stopped = true;
                                    break 'read;
                                }
                                acquired = lock.lock_owned() => guard = Some(acquired),
                            }
                        }
                        found = Some(token.clone());
                        emitted_started = true;
                    }
                    Event::Completed { .. } => {
                        emitted_completed = true;
                    }
                    _ => {}
                }
                match send_event(&events, &cancel, evt).await {
                    SendOutcome::Sent => {}
                    SendOutcome::Stopped => {
                        stopped = true;
                        break 'read;
                    }
                }
                if emitted_completed {
                    info!(engine = %engine_id, pid, "runner.completed.seen");
                    break 'read;
                }
            }
        }
        // Stop reading after the first Completed (or on cancellation); closing
        // the pipe keeps a still-chatty child from filling it while we wait.
        drop(lines);

        if stopped {
            shutdown_child(&mut child).await;
            if let Some(task) = stderr_task {
                task.abort();
            }
            if !emitted_completed {
                let evt = notes.factory().completed_error(
                    "cancelled",
                    String::new(),
                    found.clone().or(resume.clone()),
                );
                let _ = events.send(evt).await;
            }
            info!(engine = %engine_id, pid, "runner.cancelled");
            return;
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                shutdown_child(&mut child).await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                if !emitted_completed {
                    let evt = notes.factory().completed_error(
                        "cancelled",
                        String::new(),
                        found.or(resume),
                    );
                    let _ = events.send(evt).await;
                }
                return;
            }
            status = child.wait() => status,
        };
        if let Some(task) = stderr_task {
            let _ = task.await;
        }
        let code = status.as_ref().ok().and_then(|s| s.code());
        info!(engine = %engine_id, pid, code, "subprocess.exit");

        if emitted_completed {
            return;
        }

        let out = match code {
            Some(code) if code != 0 => {
                let tail = stderr_tail
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .join();
                self.engine.exit_error_events(
                    code,
                    &tail,
                    resume.as_ref(),
                    found.as_ref(),
                    &mut notes,
                    &mut state,
                )
            }
            _ => self
                .engine
                .stream_end_events(resume.as_ref(), found.as_ref(), &mut notes, &mut state),
        };
        for evt in out {
            if events.send(evt).await.is_err() {
                break;
            }
        }
    }
}

/// SIGTERM the child's process group, escalate to SIGKILL after the grace
/// period. The child was spawned with `process_group(0)`, so its pid is the
/// group id and engine-spawned grandchildren go down with it.
async fn shutdown_child(child: &mut Child) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    signal_group(child, libc::SIGTERM);
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        signal_group(child, libc::SIGKILL);
        let _ = child.wait().await;
    }
}

#[cfg(unix)]
fn signal_group(child: &mut Child, sig: libc::c_int) {
    if let Some(pid) = child.id() {
        let rc = unsafe { libc::killpg(pid as libc::c_int, sig) };
        if rc == 0 {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _sig: libc::c_int) {
    let _ = child.start_kill();
}

/// Ring buffer of recent stderr lines, capped by total byte size.
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
    cap: usize,
}

impl StderrTail {
    fn new(cap: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            cap,
        }
    }

    fn push(&mut self, line: String) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > self.cap {
            match self.lines.pop_front() {
                Some(dropped) => self.bytes -= dropped.len() + 1,
                None => break,
            }
        }
    }

    fn join(&self) -> String {
        let parts: Vec<&str> = self.lines.iter().map(String::as_str).collect();
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionKind;
    use crate::runner::event_channel;
    use regex::Regex;
    use serde_json::Value;
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    /// Minimal engine used to exercise the driver: runs `sh -c <script>` and
    /// speaks a two-event protocol (`{"type":"session","id":..}` and
    /// `{"type":"done","answer":..}`).
    struct ShEngine {
        engine: EngineId,
        codec: ResumeCodec,
        script: String,
    }

    impl ShEngine {
        fn new(script: &str) -> Self {
            let engine = EngineId::new("fake");
            let pattern =
                Regex::new(r"(?im)^\s*`?fake\s+resume\s+(?P<token>[^`\s]+)`?\s*$").unwrap();
            Self {
                engine: engine.clone(),
                codec: ResumeCodec::new(engine, pattern),
                script: script.to_string(),
            }
        }
    }

    impl JsonlEngine for ShEngine {
        type State = ();
        type Decoded = Value;

        fn engine(&self) -> &EngineId {
            &self.engine
        }

        fn codec(&self) -> &ResumeCodec {
            &self.codec
        }

        fn program(&self) -> &str {
            "sh"
        }

        fn format_resume(&self, token: &ResumeToken) -> Result<String, RunnerError> {
            Ok(format!("`fake resume {}`", token.value))
        }

        fn new_state(&self, _: &str, _: Option<&ResumeToken>, _: Option<&Path>) {}

        fn build_args(&self, _: &str, _: Option<&ResumeToken>, _: &()) -> Vec<String> {
            vec!["-c".into(), self.script.clone()]
        }

        fn stdin_payload(&self, _: &str, _: Option<&ResumeToken>, _: &()) -> Option<Vec<u8>> {
            None
        }

        fn decode_line(&self, line: &[u8]) -> Result<Value, serde_json::Error> {
            serde_json::from_slice(line)
        }

        fn translate(
            &self,
            decoded: Value,
            _state: &mut (),
            _resume: Option<&ResumeToken>,
            found: Option<&ResumeToken>,
        ) -> Vec<Event> {
            let factory = EventFactory::new(self.engine.clone());
            match decoded.get("type").and_then(Value::as_str) {
                Some("session") => {
                    let id = decoded["id"].as_str().unwrap_or("").to_string();
                    vec![factory.started(ResumeToken::new(self.engine.clone(), id), None)]
                }
                Some("done") => {
                    let answer = decoded["answer"].as_str().unwrap_or("").to_string();
                    vec![factory.completed_ok(answer, found.cloned(), None)]
                }
                _ => vec![],
            }
        }
    }

    async fn collect(engine: ShEngine, req: RunRequest) -> Vec<Event> {
        let driver = JsonlDriver::new(engine);
        let (tx, mut rx) = event_channel();
        let run = driver.run(req, tx);
        let drain = async {
            let mut out = Vec::new();
            while let Some(evt) = rx.recv().await {
                out.push(evt);
            }
            out
        };
        let (_, events) = tokio::join!(run, drain);
        events
    }

    #[tokio::test]
    async fn happy_path_emits_started_then_completed() {
        let script = r#"printf '{"type":"session","id":"s1"}\n{"type":"done","answer":"hi"}\n'"#;
        let events = collect(ShEngine::new(script), RunRequest::new("p", None)).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_started());
        match &events[1] {
            Event::Completed { ok, answer, resume, .. } => {
                assert!(*ok);
                assert_eq!(answer, "hi");
                assert_eq!(resume.as_ref().unwrap().value, "s1");
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_started_is_dropped() {
        let script = r#"printf '{"type":"session","id":"s1"}\n{"type":"session","id":"s2"}\n{"type":"done","answer":""}\n'"#;
        let events = collect(ShEngine::new(script), RunRequest::new("p", None)).await;
        let started: Vec<_> = events.iter().filter(|e| e.is_started()).collect();
        assert_eq!(started.len(), 1);
        match started[0] {
            Event::Started { resume, .. } => assert_eq!(resume.value, "s1"),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_without_completed_synthesizes_error_with_stderr_tail() {
        let script = r#"printf '{"type":"session","id":"s1"}\n'; echo 'it broke' >&2; exit 3"#;
        let events = collect(ShEngine::new(script), RunRequest::new("p", None)).await;
        let last = events.last().unwrap();
        match last {
            Event::Completed { ok, error, resume, .. } => {
                assert!(!ok);
                let error = error.as_deref().unwrap();
                assert!(error.contains("rc=3"), "error was: {error}");
                assert!(error.contains("it broke"), "error was: {error}");
                assert_eq!(resume.as_ref().unwrap().value, "s1");
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_exit_without_completed_synthesizes_stream_end_error() {
        let script = r#"printf '{"type":"session","id":"s1"}\n'"#;
        let events = collect(ShEngine::new(script), RunRequest::new("p", None)).await;
        match events.last().unwrap() {
            Event::Completed { ok, error, .. } => {
                assert!(!ok);
                assert!(error.as_deref().unwrap().contains("without a result event"));
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_json_surfaces_as_warning_action() {
        let script = r#"printf 'not json\n{"type":"done","answer":"ok"}\n'"#;
        let events = collect(ShEngine::new(script), RunRequest::new("p", None)).await;
        match &events[0] {
            Event::Action { action, ok, .. } => {
                assert_eq!(action.kind, ActionKind::Warning);
                assert_eq!(*ok, Some(false));
            }
            other => panic!("expected warning action, got {other:?}"),
        }
        assert!(events.last().unwrap().is_completed());
    }

    #[tokio::test]
    async fn cancellation_kills_child_and_emits_cancelled() {
        let script = r#"printf '{"type":"session","id":"s1"}\n'; sleep 30"#;
        let driver = JsonlDriver::new(ShEngine::new(script));
        let cancel = CancellationToken::new();
        let req = RunRequest::new("p", None).with_cancel(cancel.clone());
        let (tx, mut rx) = event_channel();

        let handle = tokio::spawn(async move { driver.run(req, tx).await });
        let first = rx.recv().await.unwrap();
        assert!(first.is_started());

        let begun = Instant::now();
        cancel.cancel();
        let evt = rx.recv().await.unwrap();
        match evt {
            Event::Completed { ok, error, resume, .. } => {
                assert!(!ok);
                assert_eq!(error.as_deref(), Some("cancelled"));
                assert_eq!(resume.unwrap().value, "s1");
            }
            other => panic!("expected cancelled completed, got {other:?}"),
        }
        handle.await.unwrap();
        // SIGTERM path, not the 30s sleep and not the SIGKILL escalation.
        assert!(begun.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn resumed_runs_serialize_on_the_thread_lock() {
        let script =
            r#"printf '{"type":"session","id":"t"}\n'; sleep 0.3; printf '{"type":"done","answer":"x"}\n'"#;
        let driver = Arc::new(JsonlDriver::new(ShEngine::new(script)));
        let token = ResumeToken::new(EngineId::new("fake"), "t");

        let run = |driver: Arc<JsonlDriver<ShEngine>>, token: ResumeToken| async move {
            let (tx, mut rx) = event_channel();
            let begun = Instant::now();
            let task = tokio::spawn(async move {
                driver
                    .run(RunRequest::new("p", Some(token)), tx)
                    .await
            });
            let mut done_at = None;
            while let Some(evt) = rx.recv().await {
                if evt.is_completed() {
                    done_at = Some(Instant::now());
                }
            }
            task.await.unwrap();
            (begun, done_at.unwrap())
        };

        let (a, b) = tokio::join!(
            run(Arc::clone(&driver), token.clone()),
            run(Arc::clone(&driver), token.clone())
        );
        // One of the two must have started only after the other finished.
        let serialized = a.0 >= b.1 || b.0 >= a.1;
        assert!(serialized, "same-thread runs overlapped: {a:?} {b:?}");
    }

    #[test]
    fn stderr_tail_is_bounded() {
        let mut tail = StderrTail::new(32);
        for i in 0..100 {
            tail.push(format!("line {i} padding padding"));
        }
        assert!(tail.join().len() <= 64);
        assert!(tail.join().contains("line 99"));
    }

    #[tokio::test]
    async fn missing_program_yields_spawn_error_completed() {
        struct Missing(ShEngine);
        impl JsonlEngine for Missing {
            type State = ();
            type Decoded = Value;
            fn engine(&self) -> &EngineId {
                self.0.engine()
            }
            fn codec(&self) -> &ResumeCodec {
                self.0.codec()
            }
            fn program(&self) -> &str {
                "definitely-not-a-real-binary-1b9a"
            }
            fn format_resume(&self, token: &ResumeToken) -> Result<String, RunnerError> {
                self.0.format_resume(token)
            }
            fn new_state(&self, _: &str, _: Option<&ResumeToken>, _: Option<&Path>) {}
            fn build_args(&self, _: &str, _: Option<&ResumeToken>, _: &()) -> Vec<String> {
                vec![]
            }
            fn decode_line(&self, line: &[u8]) -> Result<Value, serde_json::Error> {
                serde_json::from_slice(line)
            }
            fn translate(
                &self,
                _: Value,
                _: &mut (),
                _: Option<&ResumeToken>,
                _: Option<&ResumeToken>,
            ) -> Vec<Event> {
                vec![]
            }
        }

        let driver = JsonlDriver::new(Missing(ShEngine::new("")));
        let (tx, mut rx) = event_channel();
        driver.run(RunRequest::new("p", None), tx).await;
        let evt = rx.recv().await.unwrap();
        match evt {
            Event::Completed { ok, error, .. } => {
                assert!(!ok);
                assert!(error.unwrap().contains("failed to spawn"));
            }
            other => panic!("expected completed, got {other:?}"),
        }
    }
}
