//! Per-thread job scheduling.
//!
//! One engine-side conversation (a `ThreadKey`) runs at most one job at a
//! time; distinct threads run in parallel. Jobs that resume a known thread
//! queue behind it; a job that creates a brand-new thread runs provisionally
//! and is adopted into its key once the adapter reveals the token mid-run
//! (`note_thread_known`), so later submissions for that key wait for it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::sync::watch;
use tracing::debug;

use crate::model::ResumeToken;
use crate::router::RunContext;
use crate::transport::{ChannelId, MessageId};

/// A queued resume job.
#[derive(Debug, Clone)]
pub struct ThreadJob {
    pub chat_id: ChannelId,
    pub user_msg_id: MessageId,
    pub text: String,
    pub resume: ResumeToken,
    pub context: RunContext,
}

type RunJob = dyn Fn(ThreadJob) -> BoxFuture<'static, ()> + Send + Sync;

/// Signals that a provisional run for a thread has finished; `true` = done.
pub type DoneSignal = watch::Receiver<bool>;

#[derive(Default)]
struct SchedulerState {
    pending: HashMap<String, VecDeque<ThreadJob>>,
    active: HashSet<String>,
    busy_until: HashMap<String, DoneSignal>,
}

struct Inner {
    state: Mutex<SchedulerState>,
    run_job: Box<RunJob>,
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Clone)]
pub struct ThreadScheduler {
    inner: Arc<Inner>,
}

impl ThreadScheduler {
    pub fn new<F, Fut>(run_job: F) -> Self
    where
        F: Fn(ThreadJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::default()),
                run_job: Box::new(move |job| Box::pin(run_job(job))),
            }),
        }
    }

    /// Adopt an in-flight provisional run: until `done` flips, queued jobs
    /// for this thread wait instead of starting.
    pub fn note_thread_known(&self, token: &ResumeToken, done: DoneSignal) {
        let key = token.thread_key();
        {
            let mut state = self.inner.lock_state();
            match state.busy_until.get(&key) {
                Some(current) if !*current.borrow() => {
                    debug!(key = %key, "scheduler.adopt.conflict");
                }
                _ => {
                    state.busy_until.insert(key.clone(), done.clone());
                }
            }
        }
        let inner = Arc::clone(&self.inner);
        let mut done = done;
        tokio::spawn(async move {
            let _ = done.wait_for(|finished| *finished).await;
            let mut state = inner.lock_state();
            if let Some(current) = state.busy_until.get(&key) {
                if current.same_channel(&done) {
                    state.busy_until.remove(&key);
                }
            }
        });
    }

    pub fn enqueue(&self, job: ThreadJob) {
        let key = job.resume.thread_key();
        let start_worker = {
            let mut state = self.inner.lock_state();
            state.pending.entry(key.clone()).or_default().push_back(job);
            state.active.insert(key.clone())
        };
        if start_worker {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { worker(inner, key).await });
        }
    }

    #[cfg(test)]
    fn queued_len(&self, key: &str) -> usize {
        self.inner
            .lock_state()
            .pending
            .get(key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        let state = self.inner.lock_state();
        state.active.is_empty() && state.busy_until.is_empty()
    }
}

async fn worker(inner: Arc<Inner>, key: String) {
    loop {
        let (job, busy) = {
            let mut state = inner.lock_state();
            let Some(job) = state.pending.get_mut(&key).and_then(VecDeque::pop_front) else {
                state.pending.remove(&key);
                state.active.remove(&key);
                return;
            };
            (job, state.busy_until.get(&key).cloned())
        };

        // Wait out a provisional run adopted into this key.
        if let Some(mut busy) = busy {
            if !*busy.borrow() {
                let _ = busy.wait_for(|finished| *finished).await;
            }
        }

        (inner.run_job)(job).await;
    }
}
