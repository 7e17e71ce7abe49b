//! Local state of the task board.
//!
//! The list is never edited locally: it is replaced wholesale by each snapshot. User
//! actions only produce [`Request`]s and track them until the store answers.

use std::collections::BTreeMap;

use crate::models::{Document, DocumentId, Status, Task, TaskFields};
use crate::store::StoreError;
use crate::style::{status_style, CardStyle};

pub type OpId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestKind {
    Create { fields: TaskFields },
    UpdateStatus { id: DocumentId, status: Status },
    Delete { id: DocumentId },
}

impl RequestKind {
    /// The record the request acts on; creates have none until the store assigns one.
    pub fn target(&self) -> Option<&str> {
        match self {
            RequestKind::Create { .. } => None,
            RequestKind::UpdateStatus { id, .. } | RequestKind::Delete { id } => Some(id),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RequestKind::Create { .. } => "create",
            RequestKind::UpdateStatus { .. } => "update",
            RequestKind::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub op: OpId,
    pub kind: RequestKind,
}

/// What the store answered for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    Created(DocumentId),
    Done,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpState {
    Pending,
    Applied,
    Failed(StoreError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: RequestKind,
    pub state: OpState,
}

/// One card as the front end draws it.
#[derive(Debug, Clone, PartialEq)]
pub struct Row<'a> {
    /// 1-based position, only used for the "Task#n" label.
    pub ordinal: usize,
    pub id: &'a str,
    pub task: &'a str,
    pub status: &'a Status,
    pub style: CardStyle,
    pub pending: bool,
    pub failure: Option<(OpId, &'a StoreError)>,
}

#[derive(Debug, Default)]
pub struct TaskBoard {
    tasks: Vec<Task>,
    input: String,
    ops: BTreeMap<OpId, Operation>,
    next_op: OpId,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Replaces the whole list with `snapshot`, keeping delivery order. Applied operations
    /// are forgotten here since the snapshot now reflects or supersedes them.
    pub fn apply_snapshot(&mut self, snapshot: &[Document]) {
        self.tasks = snapshot.iter().map(Task::from_document).collect();
        self.ops.retain(|_, op| op.state != OpState::Applied);
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.input = text.into();
    }

    pub fn push_char(&mut self, c: char) {
        self.input.push(c);
    }

    pub fn pop_char(&mut self) {
        self.input.pop();
    }

    pub fn can_submit(&self) -> bool {
        !self.input.trim().is_empty()
    }

    /// Builds a create request from the trimmed input. The input stays as typed until the
    /// store confirms.
    pub fn submit(&mut self) -> Option<Request> {
        if !self.can_submit() {
            return None;
        }
        let fields = TaskFields::new(self.input.trim());
        Some(self.issue(RequestKind::Create { fields }))
    }

    pub fn request_delete(&mut self, id: &str) -> Option<Request> {
        self.task(id)?;
        Some(self.issue(RequestKind::Delete { id: id.to_string() }))
    }

    pub fn request_status(&mut self, id: &str, status: Status) -> Option<Request> {
        self.task(id)?;
        Some(self.issue(RequestKind::UpdateStatus {
            id: id.to_string(),
            status,
        }))
    }

    fn issue(&mut self, kind: RequestKind) -> Request {
        self.next_op += 1;
        let op = self.next_op;
        self.ops.insert(
            op,
            Operation {
                kind: kind.clone(),
                state: OpState::Pending,
            },
        );
        Request { op, kind }
    }

    /// Records the store's answer. Unknown or already settled operations are ignored.
    pub fn complete(&mut self, op: OpId, result: Result<Ack, StoreError>) -> Option<&Operation> {
        let entry = self.ops.get_mut(&op)?;
        if entry.state != OpState::Pending {
            return None;
        }
        match result {
            Ok(_) => {
                entry.state = OpState::Applied;
                if let RequestKind::Create { fields } = &entry.kind {
                    if self.input.trim() == fields.task {
                        self.input.clear();
                    }
                }
            }
            Err(err) => entry.state = OpState::Failed(err),
        }
        self.ops.get(&op)
    }

    /// Re-issues a failed operation under the same id.
    pub fn retry(&mut self, op: OpId) -> Option<Request> {
        let entry = self.ops.get_mut(&op)?;
        if !matches!(entry.state, OpState::Failed(_)) {
            return None;
        }
        entry.state = OpState::Pending;
        Some(Request {
            op,
            kind: entry.kind.clone(),
        })
    }

    pub fn dismiss(&mut self, op: OpId) -> bool {
        match self.ops.get(&op) {
            Some(entry) if matches!(entry.state, OpState::Failed(_)) => {
                self.ops.remove(&op);
                true
            }
            _ => false,
        }
    }

    pub fn dismiss_all(&mut self) {
        self.ops
            .retain(|_, op| !matches!(op.state, OpState::Failed(_)));
    }

    pub fn operation(&self, op: OpId) -> Option<&Operation> {
        self.ops.get(&op)
    }

    pub fn pending_count(&self) -> usize {
        self.ops
            .values()
            .filter(|op| op.state == OpState::Pending)
            .count()
    }

    /// Failed operations, oldest first.
    pub fn failures(&self) -> Vec<(OpId, &Operation, &StoreError)> {
        self.ops
            .iter()
            .filter_map(|(id, op)| match &op.state {
                OpState::Failed(err) => Some((*id, op, err)),
                _ => None,
            })
            .collect()
    }

    pub fn rows(&self) -> Vec<Row<'_>> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(index, task)| {
                let mut pending = false;
                let mut failure = None;
                for (id, op) in self.ops.iter() {
                    if op.kind.target() != Some(task.id.as_str()) {
                        continue;
                    }
                    match &op.state {
                        OpState::Pending => pending = true,
                        OpState::Failed(err) => failure = Some((*id, err)),
                        OpState::Applied => {}
                    }
                }
                Row {
                    ordinal: index + 1,
                    id: &task.id,
                    task: &task.task,
                    status: &task.status,
                    style: status_style(&task.status),
                    pending,
                    failure,
                }
            })
            .collect()
    }
}
