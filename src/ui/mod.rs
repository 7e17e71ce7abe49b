//! Terminal front end: one screen with the input box on top and task cards below.
//!
//! This module holds the front-end state and key handling; [`screen`] draws it and owns
//! the terminal.

#[cfg(not(test))]
mod screen;

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

use crate::board::OpId;
use crate::events::BoardEvent;
use crate::models::{DocumentId, Status, Task};
use crate::session::BoardSession;

#[cfg(not(test))]
pub use screen::run;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Focus {
    Input,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Notice {
    text: String,
    error: bool,
}

/// Front-end only state. Selection is held by record id so it follows the record when
/// snapshots reorder the list.
#[derive(Debug)]
pub struct UiState {
    focus: Focus,
    selected: Option<DocumentId>,
    notice: Option<Notice>,
    quit: bool,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            focus: Focus::Input,
            selected: None,
            notice: None,
            quit: false,
        }
    }
}

impl UiState {
    fn info(&mut self, text: impl Into<String>) {
        self.notice = Some(Notice {
            text: text.into(),
            error: false,
        });
    }

    fn error(&mut self, text: impl Into<String>) {
        self.notice = Some(Notice {
            text: text.into(),
            error: true,
        });
    }

    fn on_event(&mut self, session: &BoardSession, event: BoardEvent) {
        match event {
            BoardEvent::SnapshotApplied { .. } => {
                self.selected = reconcile_selection(session.board().tasks(), self.selected.take());
                if self.notice.as_ref().is_some_and(|n| n.error)
                    && session.board().failures().is_empty()
                {
                    self.notice = None;
                }
            }
            BoardEvent::SubscriptionFailed(err) => self.error(format!("sync error: {err}")),
            BoardEvent::RequestApplied { .. } => {}
            BoardEvent::RequestFailed { kind, error, .. } => {
                let hint = if error.is_retryable() { " (r to retry)" } else { "" };
                self.error(format!("{} failed: {error}{hint}", kind.label()));
            }
        }
    }
}

pub fn selected_index(tasks: &[Task], selected: Option<&str>) -> Option<usize> {
    let selected = selected?;
    tasks.iter().position(|t| t.id == selected)
}

/// Keeps the selection on the same record; falls back to the first card when it vanished.
pub fn reconcile_selection(tasks: &[Task], selected: Option<DocumentId>) -> Option<DocumentId> {
    match selected {
        Some(id) if tasks.iter().any(|t| t.id == id) => Some(id),
        _ => tasks.first().map(|t| t.id.clone()),
    }
}

pub fn move_selection(tasks: &[Task], selected: Option<&str>, delta: isize) -> Option<DocumentId> {
    if tasks.is_empty() {
        return None;
    }
    let next = match selected_index(tasks, selected) {
        Some(index) => (index as isize + delta).clamp(0, tasks.len() as isize - 1) as usize,
        None => 0,
    };
    Some(tasks[next].id.clone())
}

fn retry_target(session: &BoardSession, selected: Option<&str>) -> Option<OpId> {
    let from_row = selected.and_then(|id| {
        session
            .board()
            .rows()
            .into_iter()
            .find(|row| row.id == id)
            .and_then(|row| row.failure.map(|(op, _)| op))
    });
    from_row.or_else(|| session.board().failures().last().map(|(op, _, _)| *op))
}

pub fn handle_key(session: &mut BoardSession, ui: &mut UiState, key: KeyEvent) {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        ui.quit = true;
        return;
    }
    if key.code == KeyCode::Tab || key.code == KeyCode::BackTab {
        ui.focus = match ui.focus {
            Focus::Input => Focus::List,
            Focus::List => Focus::Input,
        };
        if ui.focus == Focus::List {
            ui.selected = reconcile_selection(session.board().tasks(), ui.selected.take());
        }
        return;
    }
    match ui.focus {
        Focus::Input => handle_input_key(session, ui, key),
        Focus::List => handle_list_key(session, ui, key),
    }
}

fn handle_input_key(session: &mut BoardSession, ui: &mut UiState, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => ui.quit = true,
        KeyCode::Enter => {
            if session.submit().is_some() {
                ui.info("adding task...");
            }
        }
        KeyCode::Backspace => session.pop_char(),
        KeyCode::Char(c) => session.push_char(c),
        _ => {}
    }
}

fn handle_list_key(session: &mut BoardSession, ui: &mut UiState, key: KeyEvent) {
    let selected = ui.selected.clone();
    match key.code {
        KeyCode::Esc | KeyCode::Char('q') => ui.quit = true,
        KeyCode::Down | KeyCode::Char('j') => {
            ui.selected = move_selection(session.board().tasks(), selected.as_deref(), 1);
        }
        KeyCode::Up | KeyCode::Char('k') => {
            ui.selected = move_selection(session.board().tasks(), selected.as_deref(), -1);
        }
        KeyCode::Char('d') => {
            if let Some(id) = selected {
                session.set_status(&id, Status::Done);
            }
        }
        KeyCode::Char('l') => {
            if let Some(id) = selected {
                session.set_status(&id, Status::Late);
            }
        }
        KeyCode::Char('x') | KeyCode::Delete => {
            if let Some(id) = selected {
                session.delete(&id);
            }
        }
        KeyCode::Char('r') => match retry_target(session, selected.as_deref()) {
            Some(op) => {
                session.retry(op);
                ui.info("retrying...");
            }
            None => ui.info("nothing to retry"),
        },
        KeyCode::Char('c') => {
            session.dismiss_all();
            ui.notice = None;
        }
        _ => {}
    }
}
