//! Postgres-backed `MessageStore`.
//!
//! The claim query is the load-bearing piece of this whole crate: it must
//! atomically select one eligible row, skip rows other callers are already
//! holding, and honor per-key head-of-line blocking through dead-letter
//! state — all in one round trip so two concurrent workers never observe
//! the same `id` as claimable.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relayq_core::{DeliveryMode, Message, NewMessage, Result};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::store::{MessageStore, SortOrder};

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    queue_name: String,
    payload_bytes: Vec<u8>,
    payload_type: String,
    metadata_json: Json<HashMap<String, String>>,
    added_ts: DateTime<Utc>,
    next_delivery_ts: DateTime<Utc>,
    delivery_attempts: i32,
    redelivery_attempts: i32,
    last_error: Option<String>,
    is_dead_letter: bool,
    delivery_mode: String,
    key: Option<String>,
    key_order: Option<i64>,
}

impl From<MessageRow> for Message {
    fn from(r: MessageRow) -> Self {
        Message {
            id: r.id,
            queue_name: r.queue_name,
            payload_bytes: bytes::Bytes::from(r.payload_bytes),
            payload_type: r.payload_type,
            metadata: r.metadata_json.0,
            added_at: r.added_ts,
            next_delivery_at: r.next_delivery_ts,
            delivery_attempts: r.delivery_attempts,
            redelivery_attempts: r.redelivery_attempts,
            last_delivery_error: r.last_error,
            is_dead_letter: r.is_dead_letter,
            delivery_mode: DeliveryMode::from(r.delivery_mode),
            key: r.key,
            key_order: r.key_order,
        }
    }
}

/// Implements `MessageStore` against a single shared queue table. The table
/// name is config-driven rather than a const; it is never user input, only
/// an operator-supplied config value.
pub struct PostgresMessageStore {
    pool: PgPool,
    table: String,
    /// Max in-flight lease duration (`message_handling_timeout`): once a
    /// claimed row's lease expires, the claim predicate in
    /// `claim_next_due` treats it as reclaimable again, with no separate
    /// sweeper needed.
    lease_duration: chrono::Duration,
}

impl PostgresMessageStore {
    /// `lease_duration` should match the embedder's
    /// `QueueEngineConfig::message_handling_timeout`.
    pub fn new(pool: PgPool, table_name: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            pool,
            table: table_name.into(),
            lease_duration: chrono::Duration::from_std(lease_duration).unwrap_or_else(|_| chrono::Duration::minutes(5)),
        }
    }

    fn select_columns() -> &'static str {
        "id, queue_name, payload_bytes, payload_type, metadata_json, added_ts, \
         next_delivery_ts, delivery_attempts, redelivery_attempts, last_error, \
         is_dead_letter, delivery_mode, key, key_order"
    }
}

#[async_trait]
impl MessageStore for PostgresMessageStore {
    async fn insert(&self, msg: NewMessage, delivery_delay: Option<Duration>) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let next_delivery_at = match delivery_delay {
            Some(d) => now + chrono::Duration::from_std(d).unwrap_or_default(),
            None => now,
        };
        let delivery_mode = msg.delivery_mode();
        let (key, key_order) = match &msg.ordering {
            Some(ordering) => (Some(ordering.key.clone()), Some(ordering.key_order)),
            None => (None, None),
        };

        let sql = format!(
            r#"
            INSERT INTO {table} (
                id, queue_name, payload_bytes, payload_type, metadata_json,
                added_ts, next_delivery_ts, delivery_attempts, redelivery_attempts,
                last_error, is_dead_letter, delivery_mode, key, key_order
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, 0, 0, NULL, FALSE, $8, $9, $10
            )
            "#,
            table = self.table
        );

        sqlx::query(&sql)
            .bind(id)
            .bind(&msg.queue_name)
            .bind(msg.payload_bytes.to_vec())
            .bind(&msg.payload_type)
            .bind(Json(&msg.metadata))
            .bind(now)
            .bind(next_delivery_at)
            .bind(delivery_mode.to_string())
            .bind(key)
            .bind(key_order)
            .execute(&self.pool)
            .await?;

        Ok(id)
    }

    async fn insert_as_dead_letter(&self, msg: NewMessage, cause: &str) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let delivery_mode = msg.delivery_mode();
        let (key, key_order) = match &msg.ordering {
            Some(ordering) => (Some(ordering.key.clone()), Some(ordering.key_order)),
            None => (None, None),
        };

        let sql = format!(
            r#"
            INSERT INTO {table} (
                id, queue_name, payload_bytes, payload_type, metadata_json,
                added_ts, next_delivery_ts, delivery_attempts, redelivery_attempts,
                last_error, is_dead_letter, delivery_mode, key, key_order
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $6, 1, 0, $7, TRUE, $8, $9, $10
            )
            "#,
            table = self.table
        );

        sqlx::query(&sql)
            .bind(id)
            .bind(&msg.queue_name)
            .bind(msg.payload_bytes.to_vec())
            .bind(&msg.payload_type)
            .bind(Json(&msg.metadata))
            .bind(now)
            .bind(cause)
            .bind(delivery_mode.to_string())
            .bind(key)
            .bind(key_order)
            .execute(&self.pool)
            .await?;

        Ok(id)
    }

    async fn claim_next_due(&self, queue_name: &str, now: DateTime<Utc>) -> Result<Option<Message>> {
        let sql = format!(
            r#"
            WITH candidate AS (
                SELECT m.id FROM {table} m
                WHERE m.queue_name = $1
                  AND m.is_dead_letter = FALSE
                  AND m.next_delivery_ts <= $2
                  AND (m.lease_expires_at IS NULL OR m.lease_expires_at <= $2)
                  AND NOT EXISTS (
                      SELECT 1 FROM {table} blocker
                      WHERE blocker.queue_name = m.queue_name
                        AND blocker.key = m.key
                        AND blocker.key_order < m.key_order
                        AND (
                            blocker.is_dead_letter = TRUE
                            OR (blocker.lease_expires_at IS NOT NULL AND blocker.lease_expires_at > $2)
                        )
                  )
                ORDER BY m.next_delivery_ts ASC, m.added_ts ASC, m.id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE {table} m
            SET delivery_attempts = m.delivery_attempts + 1,
                claimed_at = $2,
                lease_expires_at = $3
            FROM candidate c
            WHERE m.id = c.id
            RETURNING {columns}
            "#,
            table = self.table,
            columns = Self::select_columns(),
        );

        let lease_expires_at = now + self.lease_duration;

        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(queue_name)
            .bind(now)
            .bind(lease_expires_at)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Message::from))
    }

    async fn ack(&self, id: Uuid) -> Result<()> {
        let sql = format!("DELETE FROM {table} WHERE id = $1", table = self.table);
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        next_at: DateTime<Utc>,
        error_text: &str,
        increment_attempts: bool,
    ) -> Result<()> {
        let sql = if increment_attempts {
            format!(
                r#"
                UPDATE {table}
                SET next_delivery_ts = $2,
                    last_error = $3,
                    redelivery_attempts = redelivery_attempts + 1,
                    claimed_at = NULL,
                    lease_expires_at = NULL
                WHERE id = $1
                "#,
                table = self.table
            )
        } else {
            format!(
                r#"
                UPDATE {table}
                SET next_delivery_ts = $2,
                    last_error = $3,
                    claimed_at = NULL,
                    lease_expires_at = NULL
                WHERE id = $1
                "#,
                table = self.table
            )
        };

        sqlx::query(&sql)
            .bind(id)
            .bind(next_at)
            .bind(error_text)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_dead_letter(&self, id: Uuid, error_text: &str) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET is_dead_letter = TRUE,
                last_error = $2,
                claimed_at = NULL,
                lease_expires_at = NULL
            WHERE id = $1
            "#,
            table = self.table
        );

        sqlx::query(&sql)
            .bind(id)
            .bind(error_text)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn resurrect(&self, id: Uuid, delivery_delay: Duration) -> Result<Option<Message>> {
        let now = Utc::now();
        let next_at = now + chrono::Duration::from_std(delivery_delay).unwrap_or_default();

        let sql = format!(
            r#"
            UPDATE {table}
            SET is_dead_letter = FALSE,
                next_delivery_ts = $2,
                redelivery_attempts = 0,
                last_error = NULL,
                claimed_at = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND is_dead_letter = TRUE
            RETURNING {columns}
            "#,
            table = self.table,
            columns = Self::select_columns(),
        );

        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(next_at)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Message::from))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE id = $1 AND is_dead_letter = FALSE",
            columns = Self::select_columns(),
            table = self.table
        );

        let row: Option<MessageRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(Message::from))
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<Option<Message>> {
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE id = $1 AND is_dead_letter = TRUE",
            columns = Self::select_columns(),
            table = self.table
        );

        let row: Option<MessageRow> = sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(Message::from))
    }

    async fn list_queued(
        &self,
        queue_name: &str,
        order: SortOrder,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let direction = match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            r#"
            SELECT {columns} FROM {table}
            WHERE queue_name = $1 AND is_dead_letter = FALSE
            ORDER BY next_delivery_ts {direction}, added_ts {direction}, id {direction}
            OFFSET $2 LIMIT $3
            "#,
            columns = Self::select_columns(),
            table = self.table,
            direction = direction,
        );

        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(queue_name)
            .bind(skip)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn list_dead_letters(
        &self,
        queue_name: &str,
        order: SortOrder,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let direction = match order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            r#"
            SELECT {columns} FROM {table}
            WHERE queue_name = $1 AND is_dead_letter = TRUE
            ORDER BY added_ts {direction}, id {direction}
            OFFSET $2 LIMIT $3
            "#,
            columns = Self::select_columns(),
            table = self.table,
            direction = direction,
        );

        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(queue_name)
            .bind(skip)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn count_queued(&self, queue_name: &str) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {table} WHERE queue_name = $1 AND is_dead_letter = FALSE",
            table = self.table
        );

        let count: i64 = sqlx::query_scalar(&sql).bind(queue_name).fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn query_due_soon(
        &self,
        queue_name: &str,
        up_to: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        let sql = format!(
            r#"
            SELECT {columns} FROM {table}
            WHERE queue_name = $1 AND is_dead_letter = FALSE AND next_delivery_ts <= $2
            ORDER BY next_delivery_ts ASC, added_ts ASC, id ASC
            LIMIT $3
            "#,
            columns = Self::select_columns(),
            table = self.table,
        );

        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(queue_name)
            .bind(up_to)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    async fn purge(&self, queue_name: &str) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE queue_name = $1 AND claimed_at IS NULL",
            table = self.table
        );

        let result = sqlx::query(&sql).bind(queue_name).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
