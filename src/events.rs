use crate::board::{Ack, OpId, RequestKind};
use crate::store::StoreError;

/// What happened on a session step, for the front end to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    SnapshotApplied { count: usize },
    SubscriptionFailed(StoreError),
    RequestApplied { op: OpId, kind: RequestKind, ack: Ack },
    RequestFailed { op: OpId, kind: RequestKind, error: StoreError },
}

impl BoardEvent {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            BoardEvent::SubscriptionFailed(_) | BoardEvent::RequestFailed { .. }
        )
    }
}
