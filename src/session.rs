//! Wires a [`TaskBoard`] to a [`DocumentStore`]: one live subscription feeding the list,
//! and requests dispatched as background tasks whose answers come back on a channel.
//!
//! Request-issuing methods spawn onto the ambient tokio runtime, so they must be called
//! from within one.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::board::{Ack, OpId, Request, RequestKind, TaskBoard};
use crate::events::BoardEvent;
use crate::models::{status_patch, Status};
use crate::store::{DocumentStore, SnapshotEvent, StoreError, StoreResult, Subscription};

#[derive(Debug)]
struct Completion {
    generation: u64,
    op: OpId,
    result: Result<Ack, StoreError>,
}

enum Step {
    Delivery(Option<SnapshotEvent>),
    Completion(Completion),
}

pub struct BoardSession {
    store: Arc<dyn DocumentStore>,
    collection: String,
    board: TaskBoard,
    subscription: Option<Subscription>,
    generation: u64,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
}

impl BoardSession {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            store,
            collection: collection.into(),
            board: TaskBoard::new(),
            subscription: None,
            generation: 0,
            completions_tx,
            completions_rx,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    pub fn is_mounted(&self) -> bool {
        self.subscription.is_some()
    }

    /// Opens the subscription. Calling it again while mounted does nothing.
    pub async fn mount(&mut self) -> StoreResult<()> {
        if self.subscription.is_some() {
            return Ok(());
        }
        let subscription = self.store.subscribe(&self.collection).await?;
        self.subscription = Some(subscription);
        log::info!("session: mounted collection={}", self.collection);
        Ok(())
    }

    /// Releases the subscription and forgets all local state. Requests still in flight
    /// complete at the store but their answers are dropped.
    pub fn unmount(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
            log::info!(
                "session: unmounted collection={} pending={}",
                self.collection,
                self.board.pending_count()
            );
        }
        self.generation += 1;
        self.board = TaskBoard::new();
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.board.set_input(text);
    }

    pub fn push_char(&mut self, c: char) {
        self.board.push_char(c);
    }

    pub fn pop_char(&mut self) {
        self.board.pop_char();
    }

    pub fn submit(&mut self) -> Option<OpId> {
        let request = self.board.submit()?;
        Some(self.dispatch(request))
    }

    pub fn delete(&mut self, id: &str) -> Option<OpId> {
        let request = self.board.request_delete(id)?;
        Some(self.dispatch(request))
    }

    pub fn set_status(&mut self, id: &str, status: Status) -> Option<OpId> {
        let request = self.board.request_status(id, status)?;
        Some(self.dispatch(request))
    }

    pub fn retry(&mut self, op: OpId) -> Option<OpId> {
        let request = self.board.retry(op)?;
        Some(self.dispatch(request))
    }

    pub fn dismiss(&mut self, op: OpId) -> bool {
        self.board.dismiss(op)
    }

    pub fn dismiss_all(&mut self) {
        self.board.dismiss_all();
    }

    fn dispatch(&self, request: Request) -> OpId {
        let op = request.op;
        log::debug!(
            "session: dispatch op={op} kind={} target={:?}",
            request.kind.label(),
            request.kind.target()
        );
        let store = Arc::clone(&self.store);
        let collection = self.collection.clone();
        let tx = self.completions_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = execute(store.as_ref(), &collection, &request.kind).await;
            // The receiver lives as long as the session.
            let _ = tx.send(Completion {
                generation,
                op: request.op,
                result,
            });
        });
        op
    }

    /// Waits for the next snapshot or request answer and applies it to the board.
    ///
    /// Returns `None` when not mounted or once the store closes the subscription.
    pub async fn next_event(&mut self) -> Option<BoardEvent> {
        loop {
            let step = {
                let subscription = self.subscription.as_mut()?;
                tokio::select! {
                    delivery = subscription.next() => Step::Delivery(delivery),
                    Some(completion) = self.completions_rx.recv() => Step::Completion(completion),
                }
            };
            match step {
                Step::Delivery(None) => {
                    log::warn!("session: subscription closed collection={}", self.collection);
                    self.subscription = None;
                    return None;
                }
                Step::Delivery(Some(Ok(snapshot))) => {
                    self.board.apply_snapshot(&snapshot);
                    log::debug!("session: snapshot applied count={}", snapshot.len());
                    return Some(BoardEvent::SnapshotApplied {
                        count: snapshot.len(),
                    });
                }
                Step::Delivery(Some(Err(error))) => {
                    log::error!(
                        "session: subscription error collection={} err={error}",
                        self.collection
                    );
                    return Some(BoardEvent::SubscriptionFailed(error));
                }
                Step::Completion(completion) => {
                    if completion.generation != self.generation {
                        log::debug!("session: dropped stale answer op={}", completion.op);
                        continue;
                    }
                    if let Some(event) = self.settle(completion) {
                        return Some(event);
                    }
                }
            }
        }
    }

    fn settle(&mut self, completion: Completion) -> Option<BoardEvent> {
        let Completion { op, result, .. } = completion;
        let settled = self.board.complete(op, result.clone())?;
        let kind = settled.kind.clone();
        match result {
            Ok(ack) => {
                log::info!("session: {} applied op={op} ack={ack:?}", kind.label());
                Some(BoardEvent::RequestApplied { op, kind, ack })
            }
            Err(error) => {
                log::error!("session: {} failed op={op} err={error}", kind.label());
                Some(BoardEvent::RequestFailed { op, kind, error })
            }
        }
    }
}

async fn execute(
    store: &dyn DocumentStore,
    collection: &str,
    kind: &RequestKind,
) -> Result<Ack, StoreError> {
    match kind {
        RequestKind::Create { fields } => store
            .create(collection, fields.clone().into_fields())
            .await
            .map(Ack::Created),
        RequestKind::UpdateStatus { id, status } => store
            .update(collection, id, status_patch(status))
            .await
            .map(|()| Ack::Done),
        RequestKind::Delete { id } => store.delete(collection, id).await.map(|()| Ack::Done),
    }
}
