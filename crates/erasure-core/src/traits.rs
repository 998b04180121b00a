use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreResult;
use crate::types::{BeginOutcome, DedupRecord, DedupStats, DeletionRequest, NotificationId};

// ---------------------------------------------------------------------------
// DedupStore — durable record of notification ids already taken on
//
// Must live outside process memory in production: several stateless
// instances may receive the same notification at the same moment, and the
// atomic check-and-set is the only synchronization between them.
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomic check-and-set. Exactly one concurrent caller per id observes
    /// `Started`.
    async fn try_begin_processing(&self, id: &NotificationId) -> CoreResult<BeginOutcome>;

    async fn mark_processed(&self, id: &NotificationId) -> CoreResult<()>;

    async fn mark_failed(&self, id: &NotificationId, reason: &str) -> CoreResult<()>;

    /// Drop a `Pending` record so a later redelivery can claim it again.
    /// Records in any other state are left untouched. Returns true if a
    /// record was removed.
    async fn release(&self, id: &NotificationId) -> CoreResult<bool>;

    async fn get(&self, id: &NotificationId) -> CoreResult<Option<DedupRecord>>;

    /// Remove records first seen before `cutoff`. Returns the number removed.
    async fn prune_expired(&self, cutoff: DateTime<Utc>) -> CoreResult<u64>;

    async fn stats(&self) -> CoreResult<DedupStats>;
}

// ---------------------------------------------------------------------------
// DeletionPipeline — the external collaborator that actually removes data
//
// Fire-and-forget from the endpoint's point of view. Implementations are
// expected to be idempotent on `notification_id`.
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DeletionPipeline: Send + Sync {
    async fn enqueue_deletion(&self, request: &DeletionRequest) -> CoreResult<()>;

    /// Short label used in logs.
    fn name(&self) -> &str;
}
