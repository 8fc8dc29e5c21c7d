//! Markdown rendering of progress and final messages, plus the limit-safe
//! truncation that keeps resume/status/ctx lines intact.

use crate::model::{Action, ActionKind, ActionPhase};
use crate::progress::{ActionState, ProgressState};
use crate::transport::RenderedMessage;

const STATUS_RUNNING: &str = "▸";
const STATUS_UPDATE: &str = "↻";
const STATUS_DONE: &str = "✓";
const STATUS_FAIL: &str = "✗";

const HEADER_SEP: &str = " · ";
/// Markdown hard line break.
const HARD_BREAK: &str = "  \n";

pub const MAX_PROGRESS_ACTIONS: usize = 5;
pub const MAX_PROGRESS_CMD_LEN: usize = 300;

pub fn format_elapsed(elapsed_s: f64) -> String {
    let total = elapsed_s.max(0.0) as u64;
    let (minutes, seconds) = (total / 60, total % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

fn format_header(label: &str, engine: &str, elapsed_s: f64, step: Option<usize>) -> String {
    let mut parts = vec![label.to_string(), engine.to_string(), format_elapsed(elapsed_s)];
    if let Some(step) = step {
        parts.push(format!("step {step}"));
    }
    parts.join(HEADER_SEP)
}

fn shorten(text: &str, width: usize) -> String {
    let count = text.chars().count();
    if count <= width {
        return text.to_string();
    }
    let kept: String = text.chars().take(width.saturating_sub(1)).collect();
    format!("{}…", kept.trim_end())
}

fn exit_code_of(action: &Action) -> Option<i64> {
    action.detail.get("exit_code").and_then(|v| v.as_i64())
}

fn status_glyph(state: &ActionState) -> &'static str {
    if !state.completed {
        return if state.display_phase == ActionPhase::Updated {
            STATUS_UPDATE
        } else {
            STATUS_RUNNING
        };
    }
    match state.ok {
        Some(true) => STATUS_DONE,
        Some(false) => STATUS_FAIL,
        None => match exit_code_of(&state.action) {
            Some(code) if code != 0 => STATUS_FAIL,
            _ => STATUS_DONE,
        },
    }
}

fn format_file_change_title(action: &Action, width: usize) -> String {
    const MAX_INLINE: usize = 3;
    if let Some(changes) = action.detail.get("changes").and_then(|v| v.as_array()) {
        let mut rendered: Vec<String> = Vec::new();
        for change in changes {
            let Some(path) = change.get("path").and_then(|v| v.as_str()) else {
                continue;
            };
            let verb = change
                .get("kind")
                .and_then(|v| v.as_str())
                .unwrap_or("update");
            rendered.push(format!("{verb} `{path}`"));
        }
        if !rendered.is_empty() {
            if rendered.len() > MAX_INLINE {
                let more = rendered.len() - MAX_INLINE;
                rendered.truncate(MAX_INLINE);
                rendered.push(format!("…({more} more)"));
            }
            return format!("files: {}", shorten(&rendered.join(", "), width));
        }
    }
    let title = &action.title;
    if title.contains('/') && !title.starts_with('`') {
        return format!("files: `{}`", shorten(title, width));
    }
    format!("files: {}", shorten(title, width))
}

fn format_action_title(action: &Action, width: usize) -> String {
    match action.kind {
        ActionKind::Command => format!("`{}`", shorten(&action.title, width)),
        ActionKind::Tool => format!("tool: {}", shorten(&action.title, width)),
        ActionKind::WebSearch => format!("searched: {}", shorten(&action.title, width)),
        ActionKind::Subagent => format!("subagent: {}", shorten(&action.title, width)),
        ActionKind::FileChange => format_file_change_title(action, width),
        _ => shorten(&action.title, width),
    }
}

fn format_action_line(state: &ActionState, width: usize) -> String {
    let glyph = status_glyph(state);
    let title = format_action_title(&state.action, width);
    if state.completed {
        if let Some(code) = exit_code_of(&state.action).filter(|code| *code != 0) {
            return format!("{glyph} {title} (exit {code})");
        }
    }
    format!("{glyph} {title}")
}

fn format_footer(state: &ProgressState) -> Option<String> {
    let mut lines = Vec::new();
    if let Some(ctx) = &state.context_line {
        lines.push(ctx.clone());
    }
    if let Some(resume) = &state.resume_line {
        lines.push(resume.clone());
    }
    if lines.is_empty() {
        return None;
    }
    Some(lines.join(HARD_BREAK))
}

fn assemble(parts: &[Option<String>]) -> String {
    parts
        .iter()
        .flatten()
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub struct Presenter {
    max_actions: usize,
    command_width: usize,
}

impl Default for Presenter {
    fn default() -> Self {
        Self {
            max_actions: MAX_PROGRESS_ACTIONS,
            command_width: MAX_PROGRESS_CMD_LEN,
        }
    }
}

impl Presenter {
    pub fn new(max_actions: usize, command_width: usize) -> Self {
        Self {
            max_actions,
            command_width,
        }
    }

    fn format_actions(&self, state: &ProgressState) -> Option<String> {
        if self.max_actions == 0 || state.actions.is_empty() {
            return None;
        }
        let start = state.actions.len().saturating_sub(self.max_actions);
        let lines: Vec<String> = state.actions[start..]
            .iter()
            .map(|action| format_action_line(action, self.command_width))
            .collect();
        Some(lines.join(HARD_BREAK))
    }

    pub fn render_progress(
        &self,
        state: &ProgressState,
        elapsed_s: f64,
        label: &str,
    ) -> RenderedMessage {
        let step = (state.action_count > 0).then_some(state.action_count);
        let header = format_header(label, &state.engine, elapsed_s, step);
        RenderedMessage::new(assemble(&[
            Some(header),
            self.format_actions(state),
            format_footer(state),
        ]))
    }

    pub fn render_final(
        &self,
        state: &ProgressState,
        elapsed_s: f64,
        status: &str,
        answer: &str,
    ) -> RenderedMessage {
        let step = (state.action_count > 0).then_some(state.action_count);
        let header = format_header(status, &state.engine, elapsed_s, step);
        let answer = answer.trim();
        let body = (!answer.is_empty()).then(|| answer.to_string());
        RenderedMessage::new(assemble(&[Some(header), body, format_footer(state)]))
    }
}

fn is_ctx_line(line: &str) -> bool {
    let stripped = line.trim().trim_matches('`').trim_start();
    stripped
        .get(..4)
        .map(|prefix| prefix.eq_ignore_ascii_case("ctx:"))
        .unwrap_or(false)
}

/// Truncate a rendered message to `limit` chars.
///
/// The first line (status header), every line the runner recognizes as a
/// resume line, and the `ctx:` footer survive verbatim; the body keeps its
/// head and ends with an ellipsis marker. Output is `<= limit` chars, and
/// exactly `limit` when the body is what overflowed.
pub fn truncate_rendered(text: &str, limit: usize, is_resume_line: &dyn Fn(&str) -> bool) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let header = lines.first().copied().unwrap_or_default();

    // Peel the trailing footer block: resume lines, ctx lines, blanks.
    let mut tail_start = lines.len();
    while tail_start > 1 {
        let line = lines[tail_start - 1];
        if line.trim().is_empty() || is_resume_line(line) || is_ctx_line(line) {
            tail_start -= 1;
        } else {
            break;
        }
    }

    // Resume lines buried in the body must survive too; they move to the tail.
    let body: Vec<&str> = lines[1..tail_start]
        .iter()
        .copied()
        .filter(|line| !is_resume_line(line))
        .collect();
    let mut tail = String::new();
    for line in lines[1..tail_start]
        .iter()
        .filter(|line| is_resume_line(line))
    {
        tail.push('\n');
        tail.push_str(line);
    }
    for line in &lines[tail_start..] {
        tail.push('\n');
        tail.push_str(line);
    }

    let header_chars = header.chars().count();
    let tail_chars = tail.chars().count();
    // header + '\n' + body + '…' + tail
    let fixed = header_chars + 1 + 1 + tail_chars;
    if fixed >= limit {
        // Degenerate: the preserved lines alone overflow; keep their tail.
        let assembled = format!("{header}\n…{tail}");
        let count = assembled.chars().count();
        if count <= limit {
            return assembled;
        }
        let skip = count - limit;
        return assembled.chars().skip(skip).collect();
    }

    let budget = limit - fixed;
    let body_text = body.join("\n");
    let kept: String = body_text.chars().take(budget).collect();
    format!("{header}\n{kept}…{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EngineId, EventFactory, ResumeToken};
    use crate::progress::ProgressTracker;

    fn never_resume(_: &str) -> bool {
        false
    }

    #[test]
    fn elapsed_formats_by_magnitude() {
        assert_eq!(format_elapsed(42.0), "42s");
        assert_eq!(format_elapsed(90.0), "1m 30s");
        assert_eq!(format_elapsed(3700.0), "1h 01m");
    }

    #[test]
    fn progress_render_shows_running_and_completed_actions() {
        let factory = EventFactory::new(EngineId::new("codex"));
        let mut tracker = ProgressTracker::new("codex");
        tracker.note_event(&factory.action_started(Action::new(
            "c1",
            ActionKind::Command,
            "pytest",
        )));
        tracker.note_event(&factory.action_completed(
            Action::new("c1", ActionKind::Command, "pytest"),
            true,
        ));
        tracker.note_event(&factory.action_started(Action::new(
            "t1",
            ActionKind::Tool,
            "grep: foo",
        )));
        let state = tracker.snapshot(Some("`codex resume U`".into()), None);
        let rendered = Presenter::default().render_progress(&state, 3.0, "working");
        assert!(rendered.text.starts_with("working · codex · 3s · step 2"));
        assert!(rendered.text.contains("✓ `pytest`"));
        assert!(rendered.text.contains("▸ tool: grep: foo"));
        assert!(rendered.text.ends_with("`codex resume U`"));
    }

    #[test]
    fn failed_command_shows_exit_code() {
        let factory = EventFactory::new(EngineId::new("codex"));
        let mut tracker = ProgressTracker::new("codex");
        let mut action = Action::new("c1", ActionKind::Command, "make");
        action
            .detail
            .insert("exit_code".into(), serde_json::Value::from(2));
        tracker.note_event(&factory.action_completed(action, false));
        let state = tracker.snapshot(None, None);
        let rendered = Presenter::default().render_progress(&state, 1.0, "working");
        assert!(rendered.text.contains("✗ `make` (exit 2)"));
    }

    #[test]
    fn final_render_orders_header_answer_footer() {
        let tracker = ProgressTracker::new("codex");
        let state = tracker.snapshot(
            Some("`codex resume U`".into()),
            Some("`ctx: api @ main`".into()),
        );
        let rendered = Presenter::default().render_final(&state, 2.0, "done", "Done.");
        let expected =
            "done · codex · 2s\n\nDone.\n\n`ctx: api @ main`  \n`codex resume U`";
        assert_eq!(rendered.text, expected);
    }

    #[test]
    fn only_most_recent_actions_render() {
        let factory = EventFactory::new(EngineId::new("codex"));
        let mut tracker = ProgressTracker::new("codex");
        for i in 0..8 {
            tracker.note_event(&factory.action_started(Action::new(
                format!("a{i}"),
                ActionKind::Tool,
                format!("tool {i}"),
            )));
        }
        let state = tracker.snapshot(None, None);
        let rendered = Presenter::default().render_progress(&state, 1.0, "working");
        assert!(!rendered.text.contains("tool 2"));
        assert!(rendered.text.contains("tool 3"));
        assert!(rendered.text.contains("tool 7"));
    }

    #[test]
    fn short_messages_pass_through_untouched() {
        let text = "done · codex · 1s\n\nhi";
        assert_eq!(truncate_rendered(text, 4096, &never_resume), text);
    }

    #[test]
    fn truncation_is_exact_and_preserves_the_protected_lines() {
        let resume_line = "`codex resume U-123`";
        let ctx_line = "`ctx: api @ main`";
        let body: String = "x".repeat(8000);
        let text = format!("done · codex · 1s\n\n{body}\n\n{ctx_line}  \n{resume_line}");
        let is_resume = |line: &str| line.trim().starts_with("`codex resume");

        let out = truncate_rendered(&text, 4096, &is_resume);
        assert_eq!(out.chars().count(), 4096);
        assert!(out.starts_with("done · codex · 1s\n"));
        assert!(out.contains(resume_line));
        assert!(out.contains(ctx_line));
        let last_non_empty = out.lines().rev().find(|l| !l.trim().is_empty()).unwrap();
        assert_eq!(last_non_empty, resume_line);
        // The body keeps its head and ends with the ellipsis marker.
        let body_part = out.lines().nth(2).unwrap();
        assert!(body_part.starts_with('x'));
        assert!(body_part.ends_with('…'));
    }

    #[test]
    fn resume_lines_inside_the_body_are_not_cut() {
        let resume_line = "`codex resume EARLY`";
        let body_tail: String = "y".repeat(8000);
        let text = format!("done · codex · 1s\n\n{resume_line}\n{body_tail}");
        let is_resume = |line: &str| line.trim().starts_with("`codex resume");
        let out = truncate_rendered(&text, 4096, &is_resume);
        assert!(out.chars().count() <= 4096);
        assert!(out.contains(resume_line));
    }

    #[test]
    fn resume_round_trip_survives_rendering_and_truncation() {
        let engine = EngineId::new("codex");
        let token = ResumeToken::new(engine.clone(), "U-1");
        let mut tracker = ProgressTracker::new("codex");
        tracker.set_resume(Some(token));
        let state = tracker.snapshot(Some("`codex resume U-1`".into()), None);
        let rendered =
            Presenter::default().render_final(&state, 1.0, "done", &"z".repeat(9000));
        let is_resume = |line: &str| line.trim().starts_with("`codex resume");
        let out = truncate_rendered(&rendered.text, 4096, &is_resume);
        assert!(out.contains("`codex resume U-1`"));
    }
}
