//! Runner protocol: the capability set every engine adapter exposes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::model::{EngineId, Event, ResumeToken};

/// Capacity of the adapter → presenter event channel. Bounded so a fast
/// subprocess backpressures against a slow consumer instead of buffering
/// unbounded action payloads.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("resume token is for engine {actual:?}, not {expected:?}")]
    EngineMismatch { expected: EngineId, actual: EngineId },
}

/// One invocation of an adapter for a single prompt.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub resume: Option<ResumeToken>,
    /// Working directory for the run (project/worktree context).
    pub cwd: Option<PathBuf>,
    pub cancel: CancellationToken,
}

impl RunRequest {
    pub fn new(prompt: impl Into<String>, resume: Option<ResumeToken>) -> Self {
        Self {
            prompt: prompt.into(),
            resume,
            cwd: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// An engine adapter.
///
/// `run` pushes normalized events into `events` and returns once the run has
/// reached a terminal state. Failures after `Started` surface as
/// `Completed { ok: false, .. }` on the channel, never as panics; a run that
/// dies before `Started` may end without any event, in which case the bridge
/// synthesizes the error message.
#[async_trait]
pub trait Runner: Send + Sync {
    fn engine(&self) -> &EngineId;

    /// Canonical CLI resume line for `token`. Fails when the token belongs
    /// to a different engine.
    fn format_resume(&self, token: &ResumeToken) -> Result<String, RunnerError>;

    /// Last-match-wins extraction over `text`; `None` when no confident match.
    fn extract_resume(&self, text: &str) -> Option<ResumeToken>;

    fn is_resume_line(&self, line: &str) -> bool;

    async fn run(&self, req: RunRequest, events: EventSender);
}

/// Per-thread run locks, one registry per adapter.
///
/// The driver acquires the lock for a thread key before any events for that
/// thread become visible and holds it until the run ends, so two runs for the
/// same engine-side conversation never execute concurrently even when the
/// scheduler races an adoption. Entries are weak so idle keys vacate the map.
#[derive(Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

pub type SessionGuard = tokio::sync::OwnedMutexGuard<()>;

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, token: &ResumeToken) -> Arc<tokio::sync::Mutex<()>> {
        let key = token.thread_key();
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        map.retain(|_, weak| weak.strong_count() > 0);
        map.insert(key, Arc::downgrade(&lock));
        lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(value: &str) -> ResumeToken {
        ResumeToken::new(EngineId::new("mock"), value)
    }

    #[tokio::test]
    async fn same_key_returns_same_lock() {
        let locks = SessionLocks::new();
        let a = locks.lock_for(&token("t1"));
        let b = locks.lock_for(&token("t1"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn distinct_keys_are_independent() {
        let locks = SessionLocks::new();
        let a = locks.lock_for(&token("t1"));
        let b = locks.lock_for(&token("t2"));
        let _ga = a.lock_owned().await;
        // Locking t2 must not block behind t1.
        let _gb = b.try_lock().expect("t2 should be free while t1 is held");
    }

    #[tokio::test]
    async fn dropped_locks_vacate_the_registry() {
        let locks = SessionLocks::new();
        {
            let _a = locks.lock_for(&token("t1"));
        }
        // A fresh Arc is handed out once the old one is gone.
        let b = locks.lock_for(&token("t1"));
        assert_eq!(Arc::strong_count(&b), 1);
    }
}
