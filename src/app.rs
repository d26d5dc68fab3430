use crate::input::Action;
use crate::model::{OpKey, Selection, Snapshot};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum InputMode {
    Normal,
    Prompt,
}

/// Side effects the run loop must perform after a key press. The app itself
/// never talks to the servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    None,
    ExplainSelected(Selection),
    KillSelected(Selection),
    BatchKill { age_secs: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingConfirmation {
    KillOperation { selection: Selection },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OverlayKind {
    Explain,
    Help,
}

#[derive(Debug, Clone)]
pub struct Overlay {
    pub kind: OverlayKind,
    pub title: String,
    pub body: String,
}

pub struct App {
    pub running: bool,
    pub mode: InputMode,
    pub snapshot: Arc<Snapshot>,
    pub selected: usize,
    pub paused: bool,
    pub show_help: bool,
    pub status_message: Option<String>,
    pub overlay: Option<Overlay>,
    pub input_buffer: String,
    pub pending_confirmation: Option<PendingConfirmation>,
}

impl App {
    pub fn new() -> Self {
        Self {
            running: true,
            mode: InputMode::Normal,
            snapshot: Arc::new(Snapshot::empty()),
            selected: 0,
            paused: false,
            show_help: false,
            status_message: None,
            overlay: None,
            input_buffer: String::new(),
            pending_confirmation: None,
        }
    }

    /// Adopts a freshly published snapshot. While paused the display keeps
    /// showing the frozen snapshot; actions still resolve against the live
    /// one through the dispatcher.
    pub fn set_snapshot(&mut self, snapshot: Arc<Snapshot>) {
        if self.paused {
            return;
        }
        self.snapshot = snapshot;
        if self.snapshot.operations.is_empty() {
            self.selected = 0;
        } else if self.selected >= self.snapshot.operations.len() {
            self.selected = self.snapshot.operations.len() - 1;
        }
    }

    /// The selection the operator is looking at right now, pinned to the
    /// rendered snapshot so later actions can detect staleness.
    pub fn selection(&self) -> Option<Selection> {
        let operation = self.snapshot.operation_at(self.selected)?;
        Some(Selection {
            snapshot_id: self.snapshot.id,
            index: self.selected,
            key: operation.key.clone(),
        })
    }

    pub fn set_status(&mut self, message: impl Into<String>) {
        self.status_message = Some(message.into());
    }

    pub fn show_explain(&mut self, key: &OpKey, plan: String) {
        self.overlay = Some(Overlay {
            kind: OverlayKind::Explain,
            title: format!("explain {key}"),
            body: plan,
        });
    }

    pub fn apply_action(&mut self, action: Action) -> AppCommand {
        if self.pending_confirmation.is_some() {
            return self.apply_confirmation_action(action);
        }
        match self.mode {
            InputMode::Normal => self.apply_normal_action(action),
            InputMode::Prompt => self.apply_prompt_action(action),
        }
    }

    fn apply_confirmation_action(&mut self, action: Action) -> AppCommand {
        match action {
            Action::ConfirmYes => {
                let Some(pending) = self.pending_confirmation.take() else {
                    return AppCommand::None;
                };
                match pending {
                    PendingConfirmation::KillOperation { selection } => {
                        AppCommand::KillSelected(selection)
                    }
                }
            }
            Action::ConfirmNo | Action::CloseOverlay | Action::Quit => {
                self.pending_confirmation = None;
                self.set_status("cancelled");
                AppCommand::None
            }
            _ => AppCommand::None,
        }
    }

    fn apply_normal_action(&mut self, action: Action) -> AppCommand {
        match action {
            Action::Quit => {
                self.running = false;
            }
            Action::Down => self.move_selection(1),
            Action::Up => self.move_selection(-1),
            Action::PageDown => self.move_selection(10),
            Action::PageUp => self.move_selection(-10),
            Action::Top => self.selected = 0,
            Action::Bottom => {
                self.selected = self.snapshot.operations.len().saturating_sub(1);
            }
            Action::Explain => {
                if let Some(selection) = self.selection() {
                    return AppCommand::ExplainSelected(selection);
                }
                self.set_status("nothing selected");
            }
            Action::Kill => {
                if let Some(selection) = self.selection() {
                    self.pending_confirmation =
                        Some(PendingConfirmation::KillOperation { selection });
                } else {
                    self.set_status("nothing selected");
                }
            }
            Action::BatchKill => {
                self.mode = InputMode::Prompt;
                self.input_buffer.clear();
            }
            Action::TogglePause => {
                self.paused = !self.paused;
                self.set_status(if self.paused { "paused" } else { "resumed" });
            }
            Action::ToggleHelp => {
                self.show_help = !self.show_help;
            }
            Action::CloseOverlay => {
                if self.overlay.is_some() {
                    self.overlay = None;
                } else if self.show_help {
                    self.show_help = false;
                } else {
                    self.status_message = None;
                }
            }
            _ => {}
        }
        AppCommand::None
    }

    fn apply_prompt_action(&mut self, action: Action) -> AppCommand {
        match action {
            Action::SubmitInput => {
                self.mode = InputMode::Normal;
                let raw = std::mem::take(&mut self.input_buffer);
                match raw.trim().parse::<u64>() {
                    Ok(age_secs) if age_secs > 0 => {
                        return AppCommand::BatchKill { age_secs };
                    }
                    _ => {
                        self.set_status(format!("not a positive number of seconds: '{raw}'"));
                    }
                }
            }
            Action::CancelInput => {
                self.mode = InputMode::Normal;
                self.input_buffer.clear();
            }
            Action::Backspace => {
                self.input_buffer.pop();
            }
            Action::InputChar(c) => {
                self.input_buffer.push(c);
            }
            _ => {}
        }
        AppCommand::None
    }

    fn move_selection(&mut self, delta: i64) {
        let len = self.snapshot.operations.len();
        if len == 0 {
            self.selected = 0;
            return;
        }
        let current = self.selected as i64;
        let next = (current + delta).clamp(0, len as i64 - 1);
        self.selected = next as usize;
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Operation, OperationKind};
    use chrono::Local;
    use serde_json::json;

    fn op(server: &str, opid: &str, secs: u64) -> Operation {
        Operation {
            key: OpKey {
                server: server.to_string(),
                opid: opid.to_string(),
            },
            namespace: "app.items".to_string(),
            duration_secs: Some(secs),
            kind: OperationKind::Normal,
            op_type: "query".to_string(),
            client: "10.0.0.1:50000".to_string(),
            active: true,
            waiting_for_lock: false,
            query: json!({ "find": "items" }),
        }
    }

    fn snapshot(id: u64, operations: Vec<Operation>) -> Arc<Snapshot> {
        Arc::new(Snapshot::build(
            id,
            Local::now(),
            operations,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        ))
    }

    fn app_with_ops(count: u64) -> App {
        let mut app = App::new();
        let operations = (0..count)
            .map(|n| op("alpha", &n.to_string(), 100 - n))
            .collect();
        app.set_snapshot(snapshot(1, operations));
        app
    }

    #[test]
    fn selection_clamps_to_table_bounds() {
        let mut app = app_with_ops(3);
        app.apply_action(Action::Up);
        assert_eq!(app.selected, 0);
        app.apply_action(Action::Bottom);
        assert_eq!(app.selected, 2);
        app.apply_action(Action::Down);
        assert_eq!(app.selected, 2);
    }

    #[test]
    fn shrinking_snapshot_clamps_selection() {
        let mut app = app_with_ops(5);
        app.apply_action(Action::Bottom);
        assert_eq!(app.selected, 4);
        app.set_snapshot(snapshot(2, vec![op("alpha", "0", 100), op("alpha", "1", 99)]));
        assert_eq!(app.selected, 1);
    }

    #[test]
    fn kill_requires_confirmation_before_emitting_a_command() {
        let mut app = app_with_ops(2);
        let command = app.apply_action(Action::Kill);
        assert_eq!(command, AppCommand::None);
        assert!(app.pending_confirmation.is_some());

        let command = app.apply_action(Action::ConfirmYes);
        match command {
            AppCommand::KillSelected(selection) => {
                assert_eq!(selection.snapshot_id, 1);
                assert_eq!(selection.index, 0);
            }
            other => panic!("expected kill command, got {other:?}"),
        }
        assert!(app.pending_confirmation.is_none());
    }

    #[test]
    fn declined_confirmation_emits_nothing() {
        let mut app = app_with_ops(2);
        app.apply_action(Action::Kill);
        let command = app.apply_action(Action::ConfirmNo);
        assert_eq!(command, AppCommand::None);
        assert!(app.pending_confirmation.is_none());
    }

    #[test]
    fn selection_is_pinned_to_the_rendered_snapshot() {
        let mut app = app_with_ops(2);
        app.apply_action(Action::Down);
        let selection = app.selection().expect("selection");
        assert_eq!(selection.snapshot_id, 1);
        assert_eq!(selection.key.opid, "1");
    }

    #[test]
    fn pause_freezes_the_displayed_snapshot() {
        let mut app = app_with_ops(2);
        app.apply_action(Action::TogglePause);
        app.set_snapshot(snapshot(2, vec![op("beta", "9", 50)]));
        assert_eq!(app.snapshot.id, 1);

        app.apply_action(Action::TogglePause);
        app.set_snapshot(snapshot(3, vec![op("beta", "9", 51)]));
        assert_eq!(app.snapshot.id, 3);
    }

    #[test]
    fn batch_kill_prompt_parses_seconds() {
        let mut app = app_with_ops(1);
        app.apply_action(Action::BatchKill);
        assert_eq!(app.mode, InputMode::Prompt);
        for c in "90".chars() {
            app.apply_action(Action::InputChar(c));
        }
        let command = app.apply_action(Action::SubmitInput);
        assert_eq!(command, AppCommand::BatchKill { age_secs: 90 });
        assert_eq!(app.mode, InputMode::Normal);
    }

    #[test]
    fn batch_kill_prompt_rejects_garbage() {
        let mut app = app_with_ops(1);
        app.apply_action(Action::BatchKill);
        for c in "abc".chars() {
            app.apply_action(Action::InputChar(c));
        }
        let command = app.apply_action(Action::SubmitInput);
        assert_eq!(command, AppCommand::None);
        assert!(app.status_message.is_some());
    }

    #[test]
    fn explain_on_empty_table_sets_status() {
        let mut app = App::new();
        let command = app.apply_action(Action::Explain);
        assert_eq!(command, AppCommand::None);
        assert_eq!(app.status_message.as_deref(), Some("nothing selected"));
    }
}
