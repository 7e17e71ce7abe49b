//! Document store capability the board is wired to.
//!
//! Any backend offering live full-snapshot subscriptions plus create, update and
//! delete on a named collection can drive the board.

pub mod firestore;
pub mod local;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::models::{DocumentId, Fields, Snapshot};

pub use local::LocalStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// One delivery on a subscription.
pub type SnapshotEvent = StoreResult<Snapshot>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Permission,
    NotFound,
    Validation,
    Persistence,
}

/// Failures at the store boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("document not found: {collection}/{id}")]
    NotFound { collection: String, id: DocumentId },

    #[error("invalid fields: {0}")]
    InvalidFields(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl StoreError {
    pub fn not_found(collection: &str, id: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Transport(_) => ErrorKind::Transport,
            StoreError::PermissionDenied(_) => ErrorKind::Permission,
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::InvalidFields(_) => ErrorKind::Validation,
            StoreError::Persistence(_) => ErrorKind::Persistence,
        }
    }

    /// Whether issuing the same request again can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Persistence)
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Opens a live subscription on `collection`. The first event is the current state.
    async fn subscribe(&self, collection: &str) -> StoreResult<Subscription>;

    /// Stores a new document and returns the identifier the store assigned.
    async fn create(&self, collection: &str, fields: Fields) -> StoreResult<DocumentId>;

    /// Overwrites the named fields of an existing document.
    ///
    /// Returns [`StoreError::NotFound`] when the document does not exist.
    async fn update(&self, collection: &str, id: &str, fields: Fields) -> StoreResult<()>;

    /// Removes a document.
    ///
    /// Returns [`StoreError::NotFound`] when the document does not exist.
    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()>;
}

/// Publishing side of a subscription, held by the store.
pub(crate) type SnapshotSender = watch::Sender<Option<SnapshotEvent>>;

pub(crate) fn snapshot_channel() -> (SnapshotSender, watch::Receiver<Option<SnapshotEvent>>) {
    watch::channel(None)
}

/// Live stream of full collection snapshots.
///
/// Deliveries are latest-wins: a consumer that falls behind skips superseded
/// snapshots. Dropping the subscription releases it.
#[derive(Debug)]
pub struct Subscription {
    rx: watch::Receiver<Option<SnapshotEvent>>,
    poller: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(rx: watch::Receiver<Option<SnapshotEvent>>) -> Self {
        Self { rx, poller: None }
    }

    /// Ties a background task to this subscription; it is aborted on release.
    #[cfg(feature = "app")]
    pub(crate) fn with_poller(
        rx: watch::Receiver<Option<SnapshotEvent>>,
        poller: JoinHandle<()>,
    ) -> Self {
        Self {
            rx,
            poller: Some(poller),
        }
    }

    /// Waits for the next delivery. `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<SnapshotEvent> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(event) = self.rx.borrow_and_update().clone() {
                return Some(event);
            }
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}
