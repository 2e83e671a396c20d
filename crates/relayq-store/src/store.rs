//! The `MessageStore` contract, abstracted behind a trait so a
//! `PostgresMessageStore` and an in-memory test double can both satisfy the
//! consumer worker pool and the queue engine facade without either of those
//! depending on `sqlx` directly.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayq_core::{Message, NewMessage, Result};
use uuid::Uuid;

/// Ordering for `listQueued`/`listDeadLetters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Stores `msg` with `next_delivery_ts = now + delivery_delay` (or `now`
    /// if absent). Returns the assigned id.
    async fn insert(&self, msg: NewMessage, delivery_delay: Option<Duration>) -> Result<Uuid>;

    /// Stores `msg` already marked `is_dead_letter = true`, with
    /// `last_delivery_error = cause` and `delivery_attempts = 1`.
    async fn insert_as_dead_letter(&self, msg: NewMessage, cause: &str) -> Result<Uuid>;

    /// Atomically selects and exclusively locks the single most eligible
    /// ready row for `queue_name`, honoring per-key head-of-line blocking,
    /// and transitions it to in-flight. Returns `None` on a miss or a lost
    /// race; never surfaces a programmer-visible error to the consumer loop.
    async fn claim_next_due(&self, queue_name: &str, now: DateTime<Utc>) -> Result<Option<Message>>;

    /// Deletes the row. A no-op (not an error) if the row is already gone.
    async fn ack(&self, id: Uuid) -> Result<()>;

    /// Updates the row to re-enter `READY` at `next_at`, clearing the
    /// in-flight marker and recording `error_text`. Increments
    /// `redelivery_attempts` when `increment_attempts` is set;
    /// `delivery_attempts` is only ever bumped by `claim_next_due`.
    async fn reschedule(
        &self,
        id: Uuid,
        next_at: DateTime<Utc>,
        error_text: &str,
        increment_attempts: bool,
    ) -> Result<()>;

    /// Sets `is_dead_letter = true` and clears the in-flight marker.
    async fn mark_dead_letter(&self, id: Uuid, error_text: &str) -> Result<()>;

    /// If the row is currently a dead letter, clears the flag, sets
    /// `next_delivery_ts = now + delivery_delay`, and resets
    /// `redelivery_attempts` to 0. `delivery_attempts` itself is preserved
    /// as a historical counter. Returns the restored snapshot, or `None` if
    /// the id is absent or not currently a dead letter.
    async fn resurrect(&self, id: Uuid, delivery_delay: Duration) -> Result<Option<Message>>;

    async fn get(&self, id: Uuid) -> Result<Option<Message>>;

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<Message>>;

    async fn list_queued(
        &self,
        queue_name: &str,
        order: SortOrder,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Message>>;

    async fn list_dead_letters(
        &self,
        queue_name: &str,
        order: SortOrder,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Message>>;

    async fn count_queued(&self, queue_name: &str) -> Result<i64>;

    /// Returns up to `limit` non-dead-letter messages with
    /// `next_delivery_ts <= up_to`, ordered the same way `list_queued`
    /// (ascending) is.
    async fn query_due_soon(
        &self,
        queue_name: &str,
        up_to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Message>>;

    /// Deletes every non-in-flight row for `queue_name`. Rows currently
    /// claimed by a worker are left untouched and settle normally on their
    /// next `ack`/`reschedule`/`mark_dead_letter` call.
    async fn purge(&self, queue_name: &str) -> Result<u64>;
}
