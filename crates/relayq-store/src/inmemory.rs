//! In-memory `MessageStore` test double: the per-key head-of-line predicate
//! that the Postgres backend expresses as a `NOT EXISTS` subquery is
//! reproduced here as an in-process scan over a `RwLock<HashMap<..>>`, so
//! the scenario tests in the engine crate can run without a database.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use relayq_core::{Message, NewMessage, Result};
use uuid::Uuid;

use crate::store::{MessageStore, SortOrder};

/// Matches the Postgres backend's hardcoded claim lease (see
/// `PostgresMessageStore::claim_next_due`): a claimed row is reclaimable by
/// another worker once its lease expires, independent of any explicit
/// settle call.
fn lease_duration() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

struct Record {
    message: Message,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl Record {
    fn in_flight(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.map(|t| t > now).unwrap_or(false)
    }
}

/// An in-memory `MessageStore`. Not durable, not shared across processes —
/// strictly a test double.
#[derive(Default)]
pub struct InMemoryMessageStore {
    records: RwLock<std::collections::HashMap<Uuid, Record>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blocked_by_predecessor(
        records: &std::collections::HashMap<Uuid, Record>,
        queue_name: &str,
        key: &str,
        key_order: i64,
        now: DateTime<Utc>,
    ) -> bool {
        records.values().any(|r| {
            r.message.queue_name == queue_name
                && r.message.key.as_deref() == Some(key)
                && r.message.key_order.map(|k| k < key_order).unwrap_or(false)
                && (r.message.is_dead_letter || r.in_flight(now))
        })
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn insert(&self, msg: NewMessage, delivery_delay: Option<Duration>) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let next_delivery_at = match delivery_delay {
            Some(d) => now + chrono::Duration::from_std(d).unwrap_or_default(),
            None => now,
        };
        let delivery_mode = msg.delivery_mode();
        let (key, key_order) = match &msg.ordering {
            Some(o) => (Some(o.key.clone()), Some(o.key_order)),
            None => (None, None),
        };

        let message = Message {
            id,
            queue_name: msg.queue_name,
            payload_bytes: msg.payload_bytes,
            payload_type: msg.payload_type,
            metadata: msg.metadata,
            added_at: now,
            next_delivery_at,
            delivery_attempts: 0,
            redelivery_attempts: 0,
            last_delivery_error: None,
            is_dead_letter: false,
            delivery_mode,
            key,
            key_order,
        };

        self.records.write().insert(
            id,
            Record {
                message,
                lease_expires_at: None,
            },
        );
        Ok(id)
    }

    async fn insert_as_dead_letter(&self, msg: NewMessage, cause: &str) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let delivery_mode = msg.delivery_mode();
        let (key, key_order) = match &msg.ordering {
            Some(o) => (Some(o.key.clone()), Some(o.key_order)),
            None => (None, None),
        };

        let message = Message {
            id,
            queue_name: msg.queue_name,
            payload_bytes: msg.payload_bytes,
            payload_type: msg.payload_type,
            metadata: msg.metadata,
            added_at: now,
            next_delivery_at: now,
            delivery_attempts: 1,
            redelivery_attempts: 0,
            last_delivery_error: Some(cause.to_string()),
            is_dead_letter: true,
            delivery_mode,
            key,
            key_order,
        };

        self.records.write().insert(
            id,
            Record {
                message,
                lease_expires_at: None,
            },
        );
        Ok(id)
    }

    async fn claim_next_due(&self, queue_name: &str, now: DateTime<Utc>) -> Result<Option<Message>> {
        let mut records = self.records.write();

        let mut candidate_id = None;
        let mut candidate_key = (DateTime::<Utc>::MAX_UTC, DateTime::<Utc>::MAX_UTC, Uuid::max());

        for (id, record) in records.iter() {
            if record.in_flight(now)
                || record.message.is_dead_letter
                || record.message.queue_name != queue_name
                || record.message.next_delivery_at > now
            {
                continue;
            }

            if let (Some(key), Some(key_order)) = (&record.message.key, record.message.key_order) {
                if Self::blocked_by_predecessor(&records, queue_name, key, key_order, now) {
                    continue;
                }
            }

            let sort_key = (record.message.next_delivery_at, record.message.added_at, *id);
            if sort_key < candidate_key {
                candidate_key = sort_key;
                candidate_id = Some(*id);
            }
        }

        let id = match candidate_id {
            Some(id) => id,
            None => return Ok(None),
        };

        let record = records.get_mut(&id).expect("candidate id came from this map");
        record.lease_expires_at = Some(now + lease_duration());
        record.message.delivery_attempts += 1;
        Ok(Some(record.message.clone()))
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        self.records.write().remove(&id);
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        next_at: DateTime<Utc>,
        error_text: &str,
        increment_attempts: bool,
    ) -> Result<()> {
        if let Some(record) = self.records.write().get_mut(&id) {
            record.message.next_delivery_at = next_at;
            record.message.last_delivery_error = Some(error_text.to_string());
            record.lease_expires_at = None;
            if increment_attempts {
                record.message.redelivery_attempts += 1;
            }
        }
        Ok(())
    }

    async fn mark_dead_letter(&self, id: Uuid, error_text: &str) -> Result<()> {
        if let Some(record) = self.records.write().get_mut(&id) {
            record.message.is_dead_letter = true;
            record.message.last_delivery_error = Some(error_text.to_string());
            record.lease_expires_at = None;
        }
        Ok(())
    }

    async fn resurrect(&self, id: Uuid, delivery_delay: Duration) -> Result<Option<Message>> {
        let now = Utc::now();
        let next_at = now + chrono::Duration::from_std(delivery_delay).unwrap_or_default();

        let mut records = self.records.write();
        let record = match records.get_mut(&id) {
            Some(r) if r.message.is_dead_letter => r,
            _ => return Ok(None),
        };

        record.message.is_dead_letter = false;
        record.message.next_delivery_at = next_at;
        record.message.redelivery_attempts = 0;
        record.message.last_delivery_error = None;
        record.lease_expires_at = None;
        Ok(Some(record.message.clone()))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>> {
        Ok(self
            .records
            .read()
            .get(&id)
            .filter(|r| !r.message.is_dead_letter)
            .map(|r| r.message.clone()))
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<Message>> {
        Ok(self
            .records
            .read()
            .get(&id)
            .filter(|r| r.message.is_dead_letter)
            .map(|r| r.message.clone()))
    }

    async fn list_queued(
        &self,
        queue_name: &str,
        order: SortOrder,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let records = self.records.read();
        let mut matched: Vec<Message> = records
            .values()
            .filter(|r| !r.message.is_dead_letter && r.message.queue_name == queue_name)
            .map(|r| r.message.clone())
            .collect();

        matched.sort_by(|a, b| (a.next_delivery_at, a.added_at, a.id).cmp(&(b.next_delivery_at, b.added_at, b.id)));
        if order == SortOrder::Desc {
            matched.reverse();
        }

        Ok(matched
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_dead_letters(
        &self,
        queue_name: &str,
        order: SortOrder,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let records = self.records.read();
        let mut matched: Vec<Message> = records
            .values()
            .filter(|r| r.message.is_dead_letter && r.message.queue_name == queue_name)
            .map(|r| r.message.clone())
            .collect();

        matched.sort_by(|a, b| (a.added_at, a.id).cmp(&(b.added_at, b.id)));
        if order == SortOrder::Desc {
            matched.reverse();
        }

        Ok(matched
            .into_iter()
            .skip(skip.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_queued(&self, queue_name: &str) -> Result<i64> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| !r.message.is_dead_letter && r.message.queue_name == queue_name)
            .count() as i64)
    }

    async fn query_due_soon(
        &self,
        queue_name: &str,
        up_to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let records = self.records.read();
        let mut matched: Vec<Message> = records
            .values()
            .filter(|r| {
                !r.message.is_dead_letter
                    && r.message.queue_name == queue_name
                    && r.message.next_delivery_at <= up_to
            })
            .map(|r| r.message.clone())
            .collect();

        matched.sort_by(|a, b| (a.next_delivery_at, a.added_at, a.id).cmp(&(b.next_delivery_at, b.added_at, b.id)));
        Ok(matched.into_iter().take(limit.max(0) as usize).collect())
    }

    async fn purge(&self, queue_name: &str) -> Result<u64> {
        let now = Utc::now();
        let mut records = self.records.write();
        let to_remove: Vec<Uuid> = records
            .iter()
            .filter(|(_, r)| r.message.queue_name == queue_name && !r.in_flight(now))
            .map(|(id, _)| *id)
            .collect();

        for id in &to_remove {
            records.remove(id);
        }
        Ok(to_remove.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::faker::lorem::en::Sentence;
    use fake::Fake;

    /// A message with a throwaway fake payload — none of these tests assert
    /// on payload content, only on count/order/id, so a fixture is fine.
    fn msg(queue: &str) -> NewMessage {
        let payload: String = Sentence(3..8).fake();
        NewMessage::new(queue, "text/plain", payload)
    }

    #[tokio::test]
    async fn fifo_order_for_normal_messages() {
        let store = InMemoryMessageStore::new();
        store.insert(msg("q"), None).await.unwrap();
        store.insert(msg("q"), None).await.unwrap();
        store.insert(msg("q"), None).await.unwrap();

        assert_eq!(store.count_queued("q").await.unwrap(), 3);
        let listed = store.list_queued("q", SortOrder::Asc, 0, 20).await.unwrap();
        assert_eq!(listed.len(), 3);

        let first = store.claim_next_due("q", Utc::now()).await.unwrap().unwrap();
        assert_eq!(first.id, listed[0].id);
    }

    #[tokio::test]
    async fn dead_letter_is_invisible_to_claims() {
        let store = InMemoryMessageStore::new();
        let id = store.insert_as_dead_letter(msg("q"), "oops").await.unwrap();

        assert_eq!(store.count_queued("q").await.unwrap(), 0);
        assert!(store.claim_next_due("q", Utc::now()).await.unwrap().is_none());
        assert!(store.get_dead_letter(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ordered_messages_block_on_dead_lettered_predecessor() {
        let store = InMemoryMessageStore::new();
        let m1 = NewMessage::new("q", "t", "1").ordered("k1", 0);
        let m2 = NewMessage::new("q", "t", "2").ordered("k1", 1);
        store.insert(m1, None).await.unwrap();
        let id2 = store.insert(m2, None).await.unwrap();

        // manually dead-letter the predecessor by claiming then marking dead
        let claimed = store.claim_next_due("q", Utc::now()).await.unwrap().unwrap();
        store.mark_dead_letter(claimed.id, "boom").await.unwrap();

        assert!(store.claim_next_due("q", Utc::now()).await.unwrap().is_none());

        store.resurrect(claimed.id, Duration::from_millis(0)).await.unwrap();
        let resolved = store.claim_next_due("q", Utc::now()).await.unwrap().unwrap();
        assert_eq!(resolved.id, claimed.id);
        store.ack(resolved.id).await.unwrap();

        let next = store.claim_next_due("q", Utc::now()).await.unwrap().unwrap();
        assert_eq!(next.id, id2);
    }

    #[tokio::test]
    async fn purge_leaves_in_flight_claims_untouched() {
        let store = InMemoryMessageStore::new();
        store.insert(msg("q"), None).await.unwrap();
        let claimed = store.claim_next_due("q", Utc::now()).await.unwrap().unwrap();
        store.insert(msg("q"), None).await.unwrap();

        let purged = store.purge("q").await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get(claimed.id).await.unwrap().is_some());

        store.ack(claimed.id).await.unwrap();
        assert_eq!(store.count_queued("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn due_soon_query_respects_limit_and_matches_listed_order() {
        let store = InMemoryMessageStore::new();
        store.insert(msg("q"), None).await.unwrap();
        store.insert(msg("q"), None).await.unwrap();
        store.insert(msg("q"), None).await.unwrap();

        let up_to = Utc::now() + chrono::Duration::seconds(2);
        let all = store.query_due_soon("q", up_to, 10).await.unwrap();
        assert_eq!(all.len(), 3);

        let capped = store.query_due_soon("q", up_to, 2).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].id, all[0].id);
        assert_eq!(capped[1].id, all[1].id);

        let listed = store.list_queued("q", SortOrder::Asc, 0, 10).await.unwrap();
        assert_eq!(
            all.iter().map(|m| m.id).collect::<Vec<_>>(),
            listed.iter().map(|m| m.id).collect::<Vec<_>>()
        );
    }
}
