//! Per-progress-message run state.
//!
//! Tracks the actions a run has reported, keyed by action id so repeated
//! events for the same action collapse into one line, in first-seen order.

use crate::model::{Action, ActionKind, ActionPhase, Event, ResumeToken};

#[derive(Debug, Clone)]
pub struct ActionState {
    pub action: Action,
    pub phase: ActionPhase,
    pub ok: Option<bool>,
    /// Phase used for display: a re-`started` of an open action renders as
    /// an update rather than a fresh start.
    pub display_phase: ActionPhase,
    pub completed: bool,
    first_seen: u64,
}

/// Immutable render input produced by `ProgressTracker::snapshot`.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub engine: String,
    pub action_count: usize,
    pub actions: Vec<ActionState>,
    pub resume: Option<ResumeToken>,
    pub resume_line: Option<String>,
    pub context_line: Option<String>,
}

pub struct ProgressTracker {
    engine: String,
    resume: Option<ResumeToken>,
    action_count: usize,
    actions: std::collections::HashMap<String, ActionState>,
    seq: u64,
}

impl ProgressTracker {
    pub fn new(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            resume: None,
            action_count: 0,
            actions: std::collections::HashMap::new(),
            seq: 0,
        }
    }

    pub fn resume(&self) -> Option<&ResumeToken> {
        self.resume.as_ref()
    }

    pub fn action_count(&self) -> usize {
        self.action_count
    }

    pub fn set_resume(&mut self, resume: Option<ResumeToken>) {
        if resume.is_some() {
            self.resume = resume;
        }
    }

    /// Fold an event into the tracker; returns whether the display changed.
    pub fn note_event(&mut self, event: &Event) -> bool {
        match event {
            Event::Started { resume, .. } => {
                self.resume = Some(resume.clone());
                true
            }
            Event::Action {
                action, phase, ok, ..
            } => {
                // Turn markers structure the stream but add no display value.
                if action.kind == ActionKind::Turn {
                    return false;
                }
                if action.id.is_empty() {
                    return false;
                }
                let completed = *phase == ActionPhase::Completed;
                let existing = self.actions.get(&action.id);
                if let Some(existing) = existing {
                    // A late update for a finished action is dropped.
                    if existing.completed && !completed {
                        tracing::debug!(action_id = %action.id, "progress.update_after_completed");
                        return false;
                    }
                }
                let has_open = existing.map(|e| !e.completed).unwrap_or(false);
                let is_update =
                    *phase == ActionPhase::Updated || (*phase == ActionPhase::Started && has_open);
                let display_phase = if completed {
                    ActionPhase::Completed
                } else if is_update {
                    ActionPhase::Updated
                } else {
                    *phase
                };

                self.seq += 1;
                let first_seen = match existing {
                    Some(existing) => existing.first_seen,
                    None => {
                        self.action_count += 1;
                        self.seq
                    }
                };
                self.actions.insert(
                    action.id.clone(),
                    ActionState {
                        action: action.clone(),
                        phase: *phase,
                        ok: *ok,
                        display_phase,
                        completed,
                        first_seen,
                    },
                );
                true
            }
            Event::Completed { .. } => false,
        }
    }

    pub fn snapshot(
        &self,
        resume_line: Option<String>,
        context_line: Option<String>,
    ) -> ProgressState {
        let mut actions: Vec<ActionState> = self.actions.values().cloned().collect();
        actions.sort_by_key(|state| state.first_seen);
        ProgressState {
            engine: self.engine.clone(),
            action_count: self.action_count,
            actions,
            resume: self.resume.clone(),
            resume_line,
            context_line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EngineId, EventFactory};

    fn factory() -> EventFactory {
        EventFactory::new(EngineId::new("mock"))
    }

    #[test]
    fn started_records_resume() {
        let factory = factory();
        let mut tracker = ProgressTracker::new("mock");
        let token = ResumeToken::new(EngineId::new("mock"), "t");
        assert!(tracker.note_event(&factory.started(token.clone(), None)));
        assert_eq!(tracker.resume(), Some(&token));
    }

    #[test]
    fn repeated_action_ids_collapse_into_one_entry() {
        let factory = factory();
        let mut tracker = ProgressTracker::new("mock");
        let action = Action::new("a1", ActionKind::Command, "pytest");
        tracker.note_event(&factory.action_started(action.clone()));
        tracker.note_event(&factory.action_started(action.clone()));
        tracker.note_event(&factory.action_completed(action, true));
        assert_eq!(tracker.action_count(), 1);
        let snapshot = tracker.snapshot(None, None);
        assert_eq!(snapshot.actions.len(), 1);
        assert!(snapshot.actions[0].completed);
    }

    #[test]
    fn second_started_for_open_action_displays_as_update() {
        let factory = factory();
        let mut tracker = ProgressTracker::new("mock");
        let action = Action::new("a1", ActionKind::Tool, "grep");
        tracker.note_event(&factory.action_started(action.clone()));
        tracker.note_event(&factory.action_started(action));
        let snapshot = tracker.snapshot(None, None);
        assert_eq!(snapshot.actions[0].display_phase, ActionPhase::Updated);
    }

    #[test]
    fn update_after_completed_is_dropped() {
        let factory = factory();
        let mut tracker = ProgressTracker::new("mock");
        let action = Action::new("a1", ActionKind::Command, "pytest");
        tracker.note_event(&factory.action_completed(action.clone(), true));
        let changed = tracker.note_event(&factory.action(ActionPhase::Updated, action));
        assert!(!changed);
        assert!(tracker.snapshot(None, None).actions[0].completed);
    }

    #[test]
    fn turn_actions_are_invisible() {
        let factory = factory();
        let mut tracker = ProgressTracker::new("mock");
        let action = Action::new("turn_0", ActionKind::Turn, "turn started");
        assert!(!tracker.note_event(&factory.action_started(action)));
        assert_eq!(tracker.action_count(), 0);
    }

    #[test]
    fn snapshot_orders_actions_by_first_seen() {
        let factory = factory();
        let mut tracker = ProgressTracker::new("mock");
        tracker.note_event(&factory.action_started(Action::new("a", ActionKind::Tool, "one")));
        tracker.note_event(&factory.action_started(Action::new("b", ActionKind::Tool, "two")));
        tracker.note_event(
            &factory.action_completed(Action::new("a", ActionKind::Tool, "one"), true),
        );
        let snapshot = tracker.snapshot(None, None);
        let ids: Vec<&str> = snapshot
            .actions
            .iter()
            .map(|s| s.action.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
