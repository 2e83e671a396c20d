//! The `QueueEngine` facade: the single entry point producers and consumers
//! embed. Composes the store, the optional change notifier, and the worker
//! pool behind one object with a start/stop lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relayq_core::{
    Error, Message, NewMessage, QueueEngineConfig, RedeliveryPolicy, Result, TransactionalMode,
};
use relayq_store::{MessageStore, SortOrder};
use uuid::Uuid;

use crate::handler::Handler;
use crate::metrics::QueueMetrics;
use crate::notifier::{ChangeEvent, ChangeNotifier, ChangeOperation};
use crate::worker::{SubscriptionHandle, SubscriptionSpec, WorkerPool};

/// Parameters a caller provides to `QueueEngine::consume`. Defaults not
/// named here (transactional mode, polling interval bounds, increment
/// factor) come from the engine's `QueueEngineConfig`.
pub struct ConsumeSpec {
    pub queue_name: String,
    pub redelivery_policy: RedeliveryPolicy,
    pub parallel_consumers: usize,
    pub handler: Arc<dyn Handler>,
}

/// The durable queue engine. Cheap to clone (everything inside is `Arc`-
/// backed), so embeddings can hand copies to multiple tasks.
#[derive(Clone)]
pub struct QueueEngine {
    store: Arc<dyn MessageStore>,
    notifier: Option<Arc<dyn ChangeNotifier>>,
    pool: Arc<WorkerPool>,
    config: Arc<QueueEngineConfig>,
    running: Arc<AtomicBool>,
    metrics: Arc<QueueMetrics>,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn MessageStore>,
        config: QueueEngineConfig,
        notifier: Option<Arc<dyn ChangeNotifier>>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(WorkerPool::new(store.clone(), notifier.clone()));
        Ok(Self {
            store,
            notifier,
            pool,
            config: Arc::new(config),
            running: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(QueueMetrics::new()),
        })
    }

    /// The engine's metrics registry, for wiring into an embedder's own
    /// `/metrics` endpoint (e.g. `engine.metrics().encode()`).
    pub fn metrics(&self) -> Arc<QueueMetrics> {
        self.metrics.clone()
    }

    async fn refresh_queue_depth(&self, queue_name: &str) {
        if let Ok(depth) = self.store.count_queued(queue_name).await {
            self.metrics.set_queue_depth(queue_name, depth);
        }
    }

    fn require_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::ShutdownInProgress)
        }
    }

    fn validate_queue_name(queue_name: &str) -> Result<()> {
        if queue_name.trim().is_empty() {
            return Err(Error::invalid_input("queue_name must not be empty"));
        }
        Ok(())
    }

    fn validate_new_message(msg: &NewMessage) -> Result<()> {
        Self::validate_queue_name(&msg.queue_name)?;
        if let Some(ordering) = &msg.ordering {
            if ordering.key.trim().is_empty() {
                return Err(Error::invalid_input("ordering key must not be empty"));
            }
        }
        Ok(())
    }

    /// Marks the engine started: subscriptions may be registered and
    /// enqueue/query calls are accepted. Idempotent.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Cancels every subscription and waits up to `drain_timeout_secs` for
    /// in-flight handlers to finish.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.pool.cancel_all();
        let drained = self.pool.drain(self.config.drain_timeout()).await;
        if !drained {
            tracing::warn!(
                drain_timeout_secs = self.config.drain_timeout_secs,
                "engine stop timed out waiting for worker drain; in-flight claims will expire on their own lease"
            );
        }
    }

    async fn publish_change(&self, operation: ChangeOperation, id: Uuid, queue_name: &str) {
        if let Some(notifier) = &self.notifier {
            let event = ChangeEvent {
                table: self.config.shared_queue_table_name.clone(),
                operation,
                id,
                queue_name: queue_name.to_string(),
                observed_at: chrono::Utc::now(),
            };
            if let Err(e) = notifier.notify(event).await {
                tracing::warn!(error = %e, "failed to publish change notification");
            }
        }
    }

    /// Enqueues `msg`, ready at `now + delivery_delay` (or immediately).
    pub async fn enqueue(&self, msg: NewMessage, delivery_delay: Option<Duration>) -> Result<Uuid> {
        Self::validate_new_message(&msg)?;
        let queue_name = msg.queue_name.clone();
        let id = self.store.insert(msg, delivery_delay).await?;
        self.publish_change(ChangeOperation::Insert, id, &queue_name).await;
        self.refresh_queue_depth(&queue_name).await;
        Ok(id)
    }

    /// Enqueues `msg` already marked dead-lettered with `cause`. Useful for
    /// producers that detect an unprocessable message before it is ever
    /// handed to a consumer.
    pub async fn enqueue_as_dead_letter(&self, msg: NewMessage, cause: &str) -> Result<Uuid> {
        Self::validate_new_message(&msg)?;
        let queue_name = msg.queue_name.clone();
        let id = self.store.insert_as_dead_letter(msg, cause).await?;
        self.publish_change(ChangeOperation::Insert, id, &queue_name).await;
        Ok(id)
    }

    /// Starts a subscription: `parallel_consumers` independent workers
    /// polling `spec.queue_name`, dispatching due messages to
    /// `spec.handler`. Returns a handle the caller uses to cancel it.
    pub fn consume(&self, spec: ConsumeSpec) -> Result<SubscriptionHandle> {
        self.require_running()?;
        Ok(self.pool.subscribe(SubscriptionSpec {
            queue_name: spec.queue_name,
            redelivery_policy: spec.redelivery_policy,
            parallel_consumers: spec.parallel_consumers,
            handler: spec.handler,
            transactional_mode: self.config.transactional_mode,
            base_polling_interval: self.config.base_polling_interval(),
            max_polling_interval: self.config.max_polling_interval(),
            polling_delay_increment_factor: self.config.polling_delay_increment_factor,
            metrics: Some(self.metrics.clone()),
        }))
    }

    /// Cancels a single subscription. Equivalent to calling `cancel()` on
    /// the handle `consume` returned; provided for callers that only kept
    /// the id.
    pub fn cancel_subscription(&self, id: Uuid) {
        self.pool.cancel(id);
    }

    pub async fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.store.get(id).await
    }

    pub async fn get_dead_letter_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.store.get_dead_letter(id).await
    }

    pub async fn queued_count(&self, queue_name: &str) -> Result<i64> {
        self.store.count_queued(queue_name).await
    }

    pub async fn list_queued(
        &self,
        queue_name: &str,
        order: SortOrder,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Message>> {
        self.store.list_queued(queue_name, order, skip, limit).await
    }

    pub async fn list_dead_letters(
        &self,
        queue_name: &str,
        order: SortOrder,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<Message>> {
        self.store.list_dead_letters(queue_name, order, skip, limit).await
    }

    pub async fn query_due_soon(
        &self,
        queue_name: &str,
        up_to: chrono::DateTime<chrono::Utc>,
        limit: i64,
    ) -> Result<Vec<Message>> {
        self.store.query_due_soon(queue_name, up_to, limit).await
    }

    /// Explicit ack, for `manual_acknowledgement` subscriptions — the
    /// handler (or whatever code eventually decides the message is
    /// handled) calls this instead of relying on the worker to ack on
    /// handler success.
    pub async fn acknowledge_as_handled(&self, id: Uuid) -> Result<()> {
        self.store.ack(id).await
    }

    /// Clears a dead letter's flag and re-readies it at `now + delay`,
    /// resetting `redelivery_attempts`. `delivery_attempts` is preserved as
    /// a historical counter.
    pub async fn resurrect_dead_letter(&self, id: Uuid, delivery_delay: Duration) -> Result<Option<Message>> {
        let restored = self.store.resurrect(id, delivery_delay).await?;
        if let Some(message) = &restored {
            self.metrics.record_resurrection(&message.queue_name);
            self.publish_change(ChangeOperation::Update, id, &message.queue_name).await;
            self.refresh_queue_depth(&message.queue_name).await;
        }
        Ok(restored)
    }

    /// Deletes every non-in-flight record for `queue_name`.
    pub async fn purge(&self, queue_name: &str) -> Result<u64> {
        Self::validate_queue_name(queue_name)?;
        let deleted = self.store.purge(queue_name).await?;
        self.refresh_queue_depth(queue_name).await;
        Ok(deleted)
    }

    /// Checks whether `mode` requires the embedder to also arrange a
    /// transaction factory (`fully_transactional` does). This engine's
    /// `MessageStore` abstraction always opens its own transaction per
    /// operation; embedders that need `fully_transactional` semantics
    /// compose their own transaction around the call into
    /// `enqueue`/`acknowledge_as_handled`.
    pub fn transactional_mode(&self) -> TransactionalMode {
        self.config.transactional_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ClosureHandler;
    use fake::faker::lorem::en::Paragraph;
    use fake::Fake;
    use relayq_store::InMemoryMessageStore;
    use std::sync::Mutex;

    fn engine() -> QueueEngine {
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        QueueEngine::new(store, QueueEngineConfig::default(), None).unwrap()
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_queue_name() {
        let engine = engine();
        let msg = NewMessage::new("", "text/plain", "x");
        let err = engine.enqueue(msg, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn enqueue_then_get_message_round_trips() {
        let engine = engine();
        // Fixture payload: this test only asserts on lifecycle fields, not
        // on payload content.
        let payload: String = Paragraph(1..3).fake();
        let id = engine
            .enqueue(NewMessage::new("orders", "text/plain", payload), None)
            .await
            .unwrap();

        let fetched = engine.get_message(id).await.unwrap().unwrap();
        assert_eq!(fetched.redelivery_attempts, 0);
        assert_eq!(fetched.delivery_attempts, 0);
        assert!(!fetched.is_dead_letter);
    }

    #[tokio::test]
    async fn consume_requires_the_engine_to_be_started() {
        let engine = engine();
        let handler = Arc::new(ClosureHandler::new(|_msg| async { Ok(()) }));
        let err = engine
            .consume(ConsumeSpec {
                queue_name: "q".to_string(),
                redelivery_policy: RedeliveryPolicy::fixed(Duration::from_millis(50), 1),
                parallel_consumers: 1,
                handler,
            })
            .unwrap_err();
        assert!(matches!(err, Error::ShutdownInProgress));
    }

    #[tokio::test]
    async fn simple_fifo_delivery_end_to_end() {
        let engine = engine();
        engine.start();

        engine.enqueue(NewMessage::new("q", "text/plain", "a"), None).await.unwrap();
        engine.enqueue(NewMessage::new("q", "text/plain", "b"), None).await.unwrap();

        let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let handler = Arc::new(ClosureHandler::new(move |msg| {
            let received = received_clone.clone();
            async move {
                received
                    .lock()
                    .unwrap()
                    .push(String::from_utf8(msg.payload_bytes.to_vec()).unwrap());
                Ok(())
            }
        }));

        let handle = engine
            .consume(ConsumeSpec {
                queue_name: "q".to_string(),
                redelivery_policy: RedeliveryPolicy::fixed(Duration::from_millis(50), 1),
                parallel_consumers: 1,
                handler,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel();
        engine.stop().await;

        let mut got = received.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(engine.queued_count("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_message_can_be_resurrected_and_redelivered() {
        let engine = engine();
        engine.start();

        let id = engine
            .enqueue(NewMessage::new("q", "text/plain", "x"), None)
            .await
            .unwrap();

        let should_fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let should_fail_clone = should_fail.clone();
        let invocations = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let invocations_clone = invocations.clone();
        let handler = Arc::new(ClosureHandler::new(move |_msg| {
            let should_fail = should_fail_clone.clone();
            let invocations = invocations_clone.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                if should_fail.load(Ordering::SeqCst) {
                    Err(crate::handler::HandlerError::from("boom"))
                } else {
                    Ok(())
                }
            }
        }));

        let handle = engine
            .consume(ConsumeSpec {
                queue_name: "q".to_string(),
                redelivery_policy: RedeliveryPolicy::fixed(Duration::from_millis(5), 1),
                parallel_consumers: 1,
                handler,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.get_dead_letter_message(id).await.unwrap().is_some());
        assert_eq!(engine.queued_count("q").await.unwrap(), 0);

        should_fail.store(false, Ordering::SeqCst);
        engine.resurrect_dead_letter(id, Duration::from_millis(0)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        engine.stop().await;

        assert!(invocations.load(Ordering::SeqCst) >= 3);
        assert!(engine.get_dead_letter_message(id).await.unwrap().is_none());
        assert_eq!(engine.queued_count("q").await.unwrap(), 0);
    }
}
