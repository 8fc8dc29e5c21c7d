//! Throttled progress-message editing.
//!
//! One `ProgressEdits` worker per progress message consumes a dirty signal,
//! renders the tracker snapshot, and edits the message when the render
//! changed. Edits are spaced at least a second apart; producers never block
//! on the transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::Event;
use crate::progress::ProgressTracker;
use crate::render::Presenter;
use crate::runner::Runner;
use crate::transport::{MessageRef, RenderedMessage, Transport};

pub const EDIT_THROTTLE: Duration = Duration::from_secs(1);

pub struct ProgressEdits {
    transport: Arc<dyn Transport>,
    presenter: Arc<Presenter>,
    progress_ref: MessageRef,
    tracker: Arc<Mutex<ProgressTracker>>,
    runner: Arc<dyn Runner>,
    context_line: Option<String>,
    label: String,
    started_at: Instant,
    last_rendered: Mutex<Option<RenderedMessage>>,
    event_seq: AtomicU64,
    rendered_seq: AtomicU64,
    dirty: Notify,
    stop: CancellationToken,
}

impl ProgressEdits {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        presenter: Arc<Presenter>,
        progress_ref: MessageRef,
        tracker: Arc<Mutex<ProgressTracker>>,
        runner: Arc<dyn Runner>,
        context_line: Option<String>,
        started_at: Instant,
        last_rendered: Option<RenderedMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            presenter,
            progress_ref,
            tracker,
            runner,
            context_line,
            label: "working".to_string(),
            started_at,
            last_rendered: Mutex::new(last_rendered),
            event_seq: AtomicU64::new(0),
            rendered_seq: AtomicU64::new(0),
            dirty: Notify::new(),
            stop: CancellationToken::new(),
        })
    }

    /// Fold an event into the tracker and nudge the worker. Never blocks.
    pub fn on_event(&self, event: &Event) {
        let changed = self
            .tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .note_event(event);
        if !changed {
            return;
        }
        self.event_seq.fetch_add(1, Ordering::SeqCst);
        self.dirty.notify_one();
    }

    /// Stop the worker; pending unrendered state is abandoned (the final
    /// message supersedes it).
    pub fn stop(&self) {
        self.stop.cancel();
    }

    fn render_snapshot(&self) -> RenderedMessage {
        let tracker = self.tracker.lock().unwrap_or_else(|e| e.into_inner());
        let resume_line = tracker
            .resume()
            .and_then(|token| self.runner.format_resume(token).ok());
        let state = tracker.snapshot(resume_line, self.context_line.clone());
        drop(tracker);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        self.presenter.render_progress(&state, elapsed, &self.label)
    }

    pub async fn run(self: Arc<Self>) {
        loop {
            while self.rendered_seq.load(Ordering::SeqCst) == self.event_seq.load(Ordering::SeqCst)
            {
                tokio::select! {
                    _ = self.stop.cancelled() => return,
                    _ = self.dirty.notified() => {}
                }
            }

            let seq_at_render = self.event_seq.load(Ordering::SeqCst);
            let rendered = self.render_snapshot();
            let changed = {
                let last = self.last_rendered.lock().unwrap_or_else(|e| e.into_inner());
                last.as_ref() != Some(&rendered)
            };
            if changed {
                match self.transport.edit(self.progress_ref, &rendered).await {
                    Ok(Some(_)) => {
                        *self.last_rendered.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(rendered);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        // Edits are best-effort; the run continues.
                        debug!(error = %err, "progress.edit.failed");
                    }
                }
            }
            self.rendered_seq.store(seq_at_render, Ordering::SeqCst);

            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(EDIT_THROTTLE) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, ActionKind, EngineId, EventFactory};
    use crate::transport::{ChannelId, SendOptions, TransportError};
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingTransport {
        edits: Mutex<Vec<(Instant, String)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            _channel_id: ChannelId,
            _message: &RenderedMessage,
            _options: SendOptions,
        ) -> Result<Option<MessageRef>, TransportError> {
            Ok(None)
        }

        async fn edit(
            &self,
            target: MessageRef,
            message: &RenderedMessage,
        ) -> Result<Option<MessageRef>, TransportError> {
            self.edits
                .lock()
                .unwrap()
                .push((Instant::now(), message.text.clone()));
            Ok(Some(target))
        }

        async fn delete(&self, _target: MessageRef) -> Result<bool, TransportError> {
            Ok(true)
        }
    }

    fn edits_for(transport: Arc<RecordingTransport>) -> Arc<ProgressEdits> {
        ProgressEdits::new(
            transport,
            Arc::new(Presenter::default()),
            MessageRef {
                channel_id: 1,
                message_id: 10,
            },
            Arc::new(Mutex::new(ProgressTracker::new("mock"))),
            Arc::new(crate::runners::mock::MockRunner::new(EngineId::new("mock"))),
            None,
            Instant::now(),
            None,
        )
    }

    #[tokio::test]
    async fn coalesces_bursts_into_one_edit() {
        let transport = Arc::new(RecordingTransport::default());
        let edits = edits_for(Arc::clone(&transport));
        let worker = tokio::spawn(Arc::clone(&edits).run());

        let factory = EventFactory::new(EngineId::new("mock"));
        for i in 0..10 {
            edits.on_event(&factory.action_started(Action::new(
                format!("a{i}"),
                ActionKind::Tool,
                format!("tool {i}"),
            )));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        edits.stop();
        worker.await.unwrap();

        let recorded = transport.edits.lock().unwrap();
        // A burst of ten events produces one edit, not ten.
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].1.contains("tool 9"));
    }

    #[tokio::test]
    async fn edits_are_spaced_by_the_throttle() {
        let transport = Arc::new(RecordingTransport::default());
        let edits = edits_for(Arc::clone(&transport));
        let worker = tokio::spawn(Arc::clone(&edits).run());

        let factory = EventFactory::new(EngineId::new("mock"));
        edits.on_event(&factory.action_started(Action::new("a", ActionKind::Tool, "one")));
        tokio::time::sleep(Duration::from_millis(200)).await;
        edits.on_event(&factory.action_started(Action::new("b", ActionKind::Tool, "two")));
        tokio::time::sleep(Duration::from_millis(1300)).await;
        edits.stop();
        worker.await.unwrap();

        let recorded = transport.edits.lock().unwrap();
        assert_eq!(recorded.len(), 2);
        let gap = recorded[1].0.duration_since(recorded[0].0);
        assert!(gap >= Duration::from_millis(900), "gap was {gap:?}");
    }

    #[tokio::test]
    async fn identical_renders_do_not_edit() {
        let transport = Arc::new(RecordingTransport::default());
        let edits = edits_for(Arc::clone(&transport));
        let worker = tokio::spawn(Arc::clone(&edits).run());

        let factory = EventFactory::new(EngineId::new("mock"));
        let action = Action::new("a", ActionKind::Turn, "turn started");
        // Turn actions never change the tracker, so no edit should happen.
        edits.on_event(&factory.action_started(action));
        tokio::time::sleep(Duration::from_millis(200)).await;
        edits.stop();
        worker.await.unwrap();
        assert!(transport.edits.lock().unwrap().is_empty());
    }
}
