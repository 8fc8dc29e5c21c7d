//! The bridge loop: Telegram updates in, engine runs out.
//!
//! A single long-poller drains updates, ACL-checks chats, routes messages,
//! and hands jobs to the scheduler. Each run owns a progress message, a
//! `RunningTask` entry for `/cancel`, and an edits worker; the final answer
//! replaces the progress message when the run ends.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::{Event, ResumeToken};
use crate::presenter::ProgressEdits;
use crate::progress::ProgressTracker;
use crate::render::{truncate_rendered, Presenter};
use crate::router::{format_context_line, Job, Router, RunContext};
use crate::runner::{event_channel, RunRequest, Runner};
use crate::scheduler::{ThreadJob, ThreadScheduler};
use crate::transport::{
    IncomingMessage, MessageRef, RenderedMessage, SendOptions, Transport, TransportError,
    UpdateSource, TRANSPORT_HARD_LIMIT,
};
use crate::workspace;

const LONG_POLL_TIMEOUT_S: u64 = 50;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);

/// State for one in-flight run, keyed by its progress message.
pub struct RunningTask {
    pub cancel: CancellationToken,
    pub resume: Mutex<Option<ResumeToken>>,
    done: watch::Sender<bool>,
}

impl RunningTask {
    fn new(resume: Option<ResumeToken>) -> Arc<Self> {
        Arc::new(Self {
            cancel: CancellationToken::new(),
            resume: Mutex::new(resume),
            done: watch::channel(false).0,
        })
    }
}

pub struct BridgeConfig {
    pub allowed_chat_ids: Vec<i64>,
    /// `true`: final answer is a fresh (notifying) message and the progress
    /// message is deleted; `false`: the progress message is edited in place.
    pub final_notify: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    updates: Arc<dyn UpdateSource>,
    router: Router,
    config: Arc<Config>,
    presenter: Arc<Presenter>,
    allowed_chats: HashSet<i64>,
    final_notify: bool,
    running: Mutex<HashMap<MessageRef, Arc<RunningTask>>>,
    scheduler: OnceLock<ThreadScheduler>,
}

#[derive(Clone)]
pub struct Bridge {
    inner: Arc<Inner>,
}

fn is_cancel_command(text: &str) -> bool {
    let Some(first) = text.trim().split_whitespace().next() else {
        return false;
    };
    first == "/cancel" || first.starts_with("/cancel@")
}

fn strip_resume_lines(text: &str, runner: &dyn Runner) -> String {
    let kept: Vec<&str> = text
        .lines()
        .filter(|line| !runner.is_resume_line(line))
        .collect();
    let prompt = kept.join("\n").trim().to_string();
    if prompt.is_empty() {
        "continue".to_string()
    } else {
        prompt
    }
}

impl Bridge {
    pub fn new(
        transport: Arc<dyn Transport>,
        updates: Arc<dyn UpdateSource>,
        router: Router,
        config: Arc<Config>,
        bridge_config: BridgeConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            transport,
            updates,
            router,
            config,
            presenter: Arc::new(Presenter::default()),
            allowed_chats: bridge_config.allowed_chat_ids.into_iter().collect(),
            final_notify: bridge_config.final_notify,
            running: Mutex::new(HashMap::new()),
            scheduler: OnceLock::new(),
        });
        let for_jobs = Arc::clone(&inner);
        let scheduler = ThreadScheduler::new(move |job: ThreadJob| {
            let inner = Arc::clone(&for_jobs);
            async move { inner.run_thread_job(job).await }
        });
        let _ = inner.scheduler.set(scheduler);
        Self { inner }
    }

    /// Drain the startup backlog, then poll until the source closes.
    pub async fn run(&self) -> Result<(), TransportError> {
        let mut offset = self.inner.drain_backlog().await;
        self.inner.send_startup().await;
        loop {
            match self.inner.updates.poll(offset, LONG_POLL_TIMEOUT_S).await {
                Ok(updates) => {
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        let Some(message) = update.message else {
                            continue;
                        };
                        self.inner.clone().handle_incoming(message).await;
                    }
                }
                Err(TransportError::Closed) => return Ok(()),
                Err(err) => {
                    info!(error = %err, "loop.poll.failed");
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                }
            }
        }
    }
}

impl Inner {
    async fn drain_backlog(&self) -> Option<i64> {
        let mut offset = None;
        let mut discarded = 0usize;
        loop {
            match self.updates.poll(offset, 0).await {
                Ok(updates) if updates.is_empty() => break,
                Ok(updates) => {
                    discarded += updates.len();
                    offset = updates.last().map(|u| u.update_id + 1);
                }
                Err(_) => break,
            }
        }
        if discarded > 0 {
            info!(discarded, "loop.backlog.discarded");
        }
        offset
    }

    async fn send_startup(&self) {
        for chat_id in &self.allowed_chats {
            let message = RenderedMessage::new("takopi ready");
            if let Err(err) = self
                .transport
                .send(*chat_id, &message, SendOptions::default())
                .await
            {
                debug!(error = %err, chat_id, "loop.startup.send_failed");
            }
        }
    }

    async fn send_plain(&self, chat_id: i64, reply_to: MessageRef, text: &str) {
        let options = SendOptions {
            reply_to: Some(reply_to),
            notify: false,
        };
        if let Err(err) = self
            .transport
            .send(chat_id, &RenderedMessage::new(text), options)
            .await
        {
            warn!(error = %err, chat_id, "send.failed");
        }
    }

    async fn handle_incoming(self: Arc<Self>, message: IncomingMessage) {
        if !self.allowed_chats.contains(&message.chat_id) {
            debug!(chat_id = message.chat_id, "loop.chat_rejected");
            return;
        }
        if is_cancel_command(&message.text) {
            self.handle_cancel(&message).await;
            return;
        }

        let job = match self
            .router
            .resolve(&message.text, message.reply_to_text.as_deref())
        {
            Ok(job) => job,
            Err(err) => {
                let user_ref = MessageRef {
                    channel_id: message.chat_id,
                    message_id: message.message_id,
                };
                self.send_plain(message.chat_id, user_ref, &format!("error: {err}"))
                    .await;
                return;
            }
        };

        // Surface bad project/branch context before any work starts.
        if let Err(err) = workspace::resolve(&self.config, &job.context) {
            let user_ref = MessageRef {
                channel_id: message.chat_id,
                message_id: message.message_id,
            };
            self.send_plain(message.chat_id, user_ref, &format!("error: {err}"))
                .await;
            return;
        }

        let Job {
            runner,
            prompt,
            resume,
            context,
        } = job;

        match resume {
            Some(resume) => {
                // Known thread: strict FIFO behind whatever is in flight.
                let scheduler = self.scheduler.get().cloned();
                if let Some(scheduler) = scheduler {
                    scheduler.enqueue(ThreadJob {
                        chat_id: message.chat_id,
                        user_msg_id: message.message_id,
                        text: prompt,
                        resume,
                        context,
                    });
                }
            }
            None => {
                // Brand-new thread: run provisionally; the scheduler adopts
                // it once Started reveals the token.
                let inner = Arc::clone(&self);
                tokio::spawn(async move {
                    inner
                        .run_job(
                            message.chat_id,
                            message.message_id,
                            runner,
                            prompt,
                            None,
                            context,
                        )
                        .await;
                });
            }
        }
    }

    async fn run_thread_job(&self, job: ThreadJob) {
        let runner = self
            .router
            .registry()
            .get(&job.resume.engine)
            .unwrap_or_else(|| self.router.registry().default_runner());
        self.run_job(
            job.chat_id,
            job.user_msg_id,
            runner,
            job.text,
            Some(job.resume),
            job.context,
        )
        .await;
    }

    async fn handle_cancel(&self, message: &IncomingMessage) {
        let user_ref = MessageRef {
            channel_id: message.chat_id,
            message_id: message.message_id,
        };
        let Some(reply_id) = message.reply_to_message_id else {
            self.send_plain(
                message.chat_id,
                user_ref,
                "reply to the progress message to cancel.",
            )
            .await;
            return;
        };
        let progress_ref = MessageRef {
            channel_id: message.chat_id,
            message_id: reply_id,
        };
        let task = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&progress_ref)
            .cloned();
        match task {
            Some(task) => {
                info!(
                    chat_id = message.chat_id,
                    progress_message_id = reply_id,
                    "cancel.requested"
                );
                task.cancel.cancel();
            }
            None => {
                self.send_plain(
                    message.chat_id,
                    user_ref,
                    "nothing is currently running for that message.",
                )
                .await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_job(
        &self,
        chat_id: i64,
        user_msg_id: i64,
        runner: Arc<dyn Runner>,
        prompt: String,
        resume: Option<ResumeToken>,
        context: RunContext,
    ) {
        let started_at = Instant::now();
        let adopt = resume.is_none();
        let prompt = strip_resume_lines(&prompt, runner.as_ref());
        let context_line = format_context_line(&context);
        let cwd = workspace::resolve(&self.config, &context)
            .ok()
            .flatten();
        info!(
            engine = %runner.engine(),
            chat_id,
            user_msg_id,
            resume = resume.as_ref().map(|t| t.value.as_str()),
            "handle.incoming"
        );

        let tracker = Arc::new(Mutex::new(ProgressTracker::new(
            runner.engine().as_str().to_string(),
        )));
        if let Some(token) = &resume {
            tracker
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .set_resume(Some(token.clone()));
        }

        let resume_line_for = |tracker: &ProgressTracker| {
            tracker
                .resume()
                .and_then(|token| runner.format_resume(token).ok())
        };

        let user_ref = MessageRef {
            channel_id: chat_id,
            message_id: user_msg_id,
        };
        let initial = {
            let tracker = tracker.lock().unwrap_or_else(|e| e.into_inner());
            let state = tracker.snapshot(resume_line_for(&tracker), context_line.clone());
            self.presenter.render_progress(&state, 0.0, "starting")
        };
        let progress_ref = match self
            .transport
            .send(
                chat_id,
                &initial,
                SendOptions {
                    reply_to: Some(user_ref),
                    notify: false,
                },
            )
            .await
        {
            Ok(sent) => sent,
            Err(err) => {
                warn!(error = %err, "progress.send_failed");
                None
            }
        };

        let task = RunningTask::new(resume.clone());
        if let Some(progress_ref) = progress_ref {
            self.running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(progress_ref, Arc::clone(&task));
        }

        let edits = progress_ref.map(|progress_ref| {
            ProgressEdits::new(
                Arc::clone(&self.transport),
                Arc::clone(&self.presenter),
                progress_ref,
                Arc::clone(&tracker),
                Arc::clone(&runner),
                context_line.clone(),
                started_at,
                Some(initial),
            )
        });
        let edits_worker = edits
            .as_ref()
            .map(|edits| tokio::spawn(Arc::clone(edits).run()));

        let (events_tx, mut events_rx) = event_channel();
        let request = RunRequest {
            prompt,
            resume: resume.clone(),
            cwd,
            cancel: task.cancel.clone(),
        };
        let run_task = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run(request, events_tx).await })
        };

        let mut outcome_resume = resume.clone();
        let mut completed: Option<Event> = None;
        while let Some(event) = events_rx.recv().await {
            match &event {
                Event::Started { resume: token, .. } => {
                    outcome_resume = Some(token.clone());
                    *task.resume.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
                    if adopt {
                        if let Some(scheduler) = self.scheduler.get() {
                            scheduler.note_thread_known(token, task.done.subscribe());
                        }
                    }
                }
                Event::Completed { resume: token, .. } => {
                    if let Some(token) = token {
                        outcome_resume = Some(token.clone());
                    }
                    completed = Some(event.clone());
                }
                Event::Action { .. } => {}
            }
            if let Some(edits) = &edits {
                edits.on_event(&event);
            }
        }
        if let Err(err) = run_task.await {
            warn!(error = %err, "handle.runner_task_failed");
        }

        // Teardown before the final render: release the thread for queued
        // jobs and stop progress edits.
        task.done.send_replace(true);
        if let Some(progress_ref) = progress_ref {
            self.running
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&progress_ref);
        }
        if let Some(edits) = &edits {
            edits.stop();
        }
        if let Some(worker) = edits_worker {
            let _ = worker.await;
        }

        let elapsed = started_at.elapsed().as_secs_f64();
        let was_cancelled = task.cancel.is_cancelled();

        let (status, answer) = match &completed {
            _ if was_cancelled => {
                let answer = match &completed {
                    Some(Event::Completed { answer, .. }) => answer.clone(),
                    _ => String::new(),
                };
                ("cancelled", answer)
            }
            Some(Event::Completed {
                ok, answer, error, ..
            }) => {
                let mut body = answer.clone();
                if !*ok {
                    if let Some(error) = error {
                        if body.trim().is_empty() {
                            body = error.clone();
                        } else {
                            body = format!("{body}\n\n{error}");
                        }
                    }
                }
                let status = if !*ok || body.trim().is_empty() {
                    "error"
                } else {
                    "done"
                };
                (status, body)
            }
            _ => ("error", "run ended without completion".to_string()),
        };

        info!(
            engine = %runner.engine(),
            status,
            elapsed_s = format!("{elapsed:.2}"),
            resume = outcome_resume.as_ref().map(|t| t.value.as_str()),
            "runner.completed"
        );

        let final_rendered = {
            let mut tracker = tracker.lock().unwrap_or_else(|e| e.into_inner());
            tracker.set_resume(outcome_resume);
            let state = tracker.snapshot(resume_line_for(&tracker), context_line.clone());
            self.presenter
                .render_final(&state, elapsed, status, &answer)
        };
        let is_resume = |line: &str| runner.is_resume_line(line);
        let text = truncate_rendered(&final_rendered.text, TRANSPORT_HARD_LIMIT, &is_resume);
        let final_message = RenderedMessage::new(text);

        self.deliver_final(chat_id, user_ref, progress_ref, &final_message)
            .await;
    }

    async fn deliver_final(
        &self,
        chat_id: i64,
        user_ref: MessageRef,
        progress_ref: Option<MessageRef>,
        message: &RenderedMessage,
    ) {
        if !self.final_notify {
            if let Some(progress_ref) = progress_ref {
                match self.transport.edit(progress_ref, message).await {
                    Ok(Some(_)) => return,
                    Ok(None) => {}
                    Err(err) => warn!(error = %err, "final.edit_failed"),
                }
            }
        }
        let options = SendOptions {
            reply_to: Some(user_ref),
            notify: self.final_notify,
        };
        match self.transport.send(chat_id, message, options).await {
            Ok(Some(_)) => {
                if let Some(progress_ref) = progress_ref {
                    if let Err(err) = self.transport.delete(progress_ref).await {
                        debug!(error = %err, "final.delete_progress_failed");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "final.send_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EngineId;
    use crate::runners::mock::MockRunner;

    #[test]
    fn cancel_command_matches_with_suffix_and_args() {
        assert!(is_cancel_command("/cancel"));
        assert!(is_cancel_command("/cancel@takopi_bot"));
        assert!(is_cancel_command("  /cancel please"));
        assert!(!is_cancel_command("/cancels"));
        assert!(!is_cancel_command("cancel"));
    }

    #[test]
    fn resume_lines_are_stripped_from_prompts() {
        let runner = MockRunner::new(EngineId::new("mock"));
        let text = "add tests\n`mock resume abc`";
        assert_eq!(strip_resume_lines(text, &runner), "add tests");
        assert_eq!(strip_resume_lines("`mock resume abc`", &runner), "continue");
    }
}
