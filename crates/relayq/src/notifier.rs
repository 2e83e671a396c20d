//! Change Notifier (optional): wakes idle polling workers when a new message
//! is inserted, instead of waiting out the rest of a stretched polling
//! interval. The in-process and Postgres LISTEN/NOTIFY-backed variants sit
//! behind the same `broadcast::Sender`-based shape.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use relayq_core::Result;

/// The kind of row change that triggered a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// Wire shape of a change notification: `{table, operation, id,
/// queue_name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub operation: ChangeOperation,
    pub id: Uuid,
    pub queue_name: String,
    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

/// Publishes and fans out change events. `subscribe` is called once per
/// subscription; every subsequent event reaches every subscriber.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Publishes `event` to every current and future subscriber. The engine
    /// calls this right after a successful `MessageStore::insert`. Default
    /// is a no-op, for notifier variants with no publish side (there are
    /// none today, but a test double might only need `subscribe`).
    async fn notify(&self, _event: ChangeEvent) -> Result<()> {
        Ok(())
    }
}

/// Pure in-process notifier: the engine calls `publish` itself right after
/// `MessageStore::insert` succeeds. No database round trip, so it only
/// wakes workers within this process — fine for a single-binary embedding,
/// insufficient across a fleet (use `PostgresChangeNotifier` there).
pub struct BroadcastChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
}

impl BroadcastChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No subscribers is the common case for queues nobody is polling
        // yet; that's not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for BroadcastChangeNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ChangeNotifier for BroadcastChangeNotifier {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    async fn notify(&self, event: ChangeEvent) -> Result<()> {
        self.publish(event);
        Ok(())
    }
}

/// LISTEN/NOTIFY-backed notifier: a background task listens on `channel`
/// and rebroadcasts every payload in-process via the same
/// `broadcast::Sender` shape as `BroadcastChangeNotifier`, so multiple
/// engine instances against the same database all wake up together.
pub struct PostgresChangeNotifier {
    tx: broadcast::Sender<ChangeEvent>,
    pool: PgPool,
    channel: String,
}

impl PostgresChangeNotifier {
    /// Connects a `PgListener` to `channel` and spawns the forwarding task.
    /// Degrades to pure polling if the initial `LISTEN` fails — callers
    /// still get a working `ChangeNotifier`, just one that never fires.
    pub async fn connect(pool: &PgPool, channel: &str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);

        match PgListener::connect_with(pool).await {
            Ok(mut listener) => {
                if let Err(e) = listener.listen(channel).await {
                    tracing::warn!(error = %e, channel, "failed to LISTEN; notifier degrades to pure polling");
                    return Self {
                        tx,
                        pool: pool.clone(),
                        channel: channel.to_string(),
                    };
                }

                let forward_tx = tx.clone();
                tokio::spawn(async move {
                    loop {
                        match listener.recv().await {
                            Ok(notification) => {
                                match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                                    Ok(event) => {
                                        let _ = forward_tx.send(event);
                                    }
                                    Err(e) => {
                                        tracing::warn!(error = %e, "malformed change notification payload");
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "change notification listener disconnected");
                                break;
                            }
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to connect change notification listener; degrading to pure polling");
            }
        }

        Self {
            tx,
            pool: pool.clone(),
            channel: channel.to_string(),
        }
    }

    /// `NOTIFY channel, payload` — called by the engine after a successful
    /// enqueue when a Postgres notifier is configured.
    pub async fn publish(pool: &PgPool, channel: &str, event: &ChangeEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeNotifier for PostgresChangeNotifier {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    async fn notify(&self, event: ChangeEvent) -> Result<()> {
        Self::publish(&self.pool, &self.channel, &event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_notifier_fans_out_to_subscribers() {
        let notifier = BroadcastChangeNotifier::new(16);
        let mut rx1 = notifier.subscribe();
        let mut rx2 = notifier.subscribe();

        notifier.publish(ChangeEvent {
            table: "relayq_messages".to_string(),
            operation: ChangeOperation::Insert,
            id: Uuid::now_v7(),
            queue_name: "orders".to_string(),
            observed_at: Utc::now(),
        });

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();
        assert_eq!(e1.queue_name, "orders");
        assert_eq!(e2.queue_name, "orders");
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let notifier = BroadcastChangeNotifier::new(16);
        notifier.publish(ChangeEvent {
            table: "relayq_messages".to_string(),
            operation: ChangeOperation::Insert,
            id: Uuid::now_v7(),
            queue_name: "orders".to_string(),
            observed_at: Utc::now(),
        });
    }
}
