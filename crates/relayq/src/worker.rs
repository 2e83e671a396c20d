//! Consumer Worker Pool: the poll → claim → handler → settle loop, run as
//! `parallel_consumers` independent tasks per subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use relayq_core::{RedeliveryPolicy, Result, TransactionalMode};
use relayq_store::MessageStore;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::handler::Handler;
use crate::metrics::QueueMetrics;
use crate::notifier::ChangeNotifier;
use crate::optimizer::PollingOptimizer;

/// A live subscription's cancel switch, handed back to `consume` callers.
/// Cancelling never interrupts an in-flight handler: it only stops further
/// claims from being taken.
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: Uuid,
    cancel_flag: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Idempotent: calling this more than once is harmless.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }
}

struct ActiveSubscription {
    cancel_flag: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

/// Parameters a `QueueEngine::consume` call fixes for the lifetime of one
/// subscription.
pub struct SubscriptionSpec {
    pub queue_name: String,
    pub redelivery_policy: RedeliveryPolicy,
    pub parallel_consumers: usize,
    pub handler: Arc<dyn Handler>,
    pub transactional_mode: TransactionalMode,
    pub base_polling_interval: Duration,
    pub max_polling_interval: Duration,
    pub polling_delay_increment_factor: f64,
    pub metrics: Option<Arc<QueueMetrics>>,
}

/// Owns every active subscription's tasks and cancel switches. The engine
/// facade holds one `WorkerPool`; subscription registration/cancellation is
/// single-writer — callers do not register or cancel subscriptions for the
/// same engine concurrently from multiple threads.
pub struct WorkerPool {
    store: Arc<dyn MessageStore>,
    notifier: Option<Arc<dyn ChangeNotifier>>,
    subscriptions: DashMap<Uuid, ActiveSubscription>,
}

impl WorkerPool {
    pub fn new(store: Arc<dyn MessageStore>, notifier: Option<Arc<dyn ChangeNotifier>>) -> Self {
        Self {
            store,
            notifier,
            subscriptions: DashMap::new(),
        }
    }

    /// Starts `spec.parallel_consumers` independent worker tasks sharing one
    /// `PollingOptimizer` and one cancel switch; workers otherwise share no
    /// mutable state beyond the store.
    pub fn subscribe(&self, spec: SubscriptionSpec) -> SubscriptionHandle {
        let id = Uuid::now_v7();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let cancel_notify = Arc::new(Notify::new());
        let optimizer = Arc::new(PollingOptimizer::new(
            spec.base_polling_interval,
            spec.max_polling_interval,
            spec.polling_delay_increment_factor,
        ));

        let mut tasks = Vec::with_capacity(spec.parallel_consumers.max(1));
        for _ in 0..spec.parallel_consumers.max(1) {
            let store = self.store.clone();
            let handler = spec.handler.clone();
            let queue_name = spec.queue_name.clone();
            let policy = spec.redelivery_policy;
            let mode = spec.transactional_mode;
            let optimizer = optimizer.clone();
            let cancel_flag = cancel_flag.clone();
            let cancel_notify = cancel_notify.clone();
            let wake_rx = self.notifier.as_ref().map(|n| n.subscribe());
            let metrics = spec.metrics.clone();

            tasks.push(tokio::spawn(async move {
                run_worker(
                    store,
                    queue_name,
                    policy,
                    handler,
                    mode,
                    optimizer,
                    cancel_flag,
                    cancel_notify,
                    wake_rx,
                    metrics,
                )
                .await;
            }));
        }

        self.subscriptions.insert(
            id,
            ActiveSubscription {
                cancel_flag: cancel_flag.clone(),
                cancel_notify: cancel_notify.clone(),
                tasks,
            },
        );

        SubscriptionHandle {
            id,
            cancel_flag,
            cancel_notify,
        }
    }

    pub fn cancel(&self, id: Uuid) {
        if let Some(sub) = self.subscriptions.get(&id) {
            sub.cancel_flag.store(true, Ordering::SeqCst);
            sub.cancel_notify.notify_waiters();
        }
    }

    pub fn cancel_all(&self) {
        for sub in self.subscriptions.iter() {
            sub.cancel_flag.store(true, Ordering::SeqCst);
            sub.cancel_notify.notify_waiters();
        }
    }

    /// Waits for every subscription's tasks to finish, up to `timeout`.
    /// Returns `true` if all drained cleanly. Callers are expected to have
    /// already called `cancel_all`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let ids: Vec<Uuid> = self.subscriptions.iter().map(|e| *e.key()).collect();
        let mut all_handles = Vec::new();
        for id in ids {
            if let Some((_, sub)) = self.subscriptions.remove(&id) {
                all_handles.extend(sub.tasks);
            }
        }

        let drained = tokio::time::timeout(timeout, futures::future::join_all(all_handles)).await;
        drained.is_ok()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    store: Arc<dyn MessageStore>,
    queue_name: String,
    policy: RedeliveryPolicy,
    handler: Arc<dyn Handler>,
    mode: TransactionalMode,
    optimizer: Arc<PollingOptimizer>,
    cancel_flag: Arc<AtomicBool>,
    cancel_notify: Arc<Notify>,
    mut wake_rx: Option<tokio::sync::broadcast::Receiver<crate::notifier::ChangeEvent>>,
    metrics: Option<Arc<QueueMetrics>>,
) {
    while !cancel_flag.load(Ordering::SeqCst) {
        let now = Utc::now();
        match store.claim_next_due(&queue_name, now).await {
            Ok(Some(message)) => {
                optimizer.hit();
                if let Some(m) = &metrics {
                    m.record_claim(&queue_name);
                }
                let id = message.id;
                if let Err(e) = settle(&store, &policy, handler.as_ref(), message, mode, metrics.as_deref()).await {
                    tracing::warn!(error = %e, message_id = %id, queue = %queue_name, "failed to settle claimed message");
                }
            }
            Ok(None) => {
                optimizer.miss();
                wait_for_next_poll(&optimizer, &cancel_flag, &cancel_notify, wake_rx.as_mut()).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, queue = %queue_name, "transient store failure; retrying at next poll");
                wait_for_next_poll(&optimizer, &cancel_flag, &cancel_notify, wake_rx.as_mut()).await;
            }
        }
    }
}

/// Invokes the handler and applies the settle decision: ack on success
/// (except `manual_acknowledgement`, where the handler owns acking); on
/// failure, reschedule per policy or dead-letter once the policy is
/// exhausted.
async fn settle(
    store: &Arc<dyn MessageStore>,
    policy: &RedeliveryPolicy,
    handler: &dyn Handler,
    message: relayq_core::QueuedMessage,
    mode: TransactionalMode,
    metrics: Option<&QueueMetrics>,
) -> Result<()> {
    let id = message.id;
    let queue_name = message.queue_name.clone();
    let redelivery_attempts = message.redelivery_attempts.max(0) as u32;

    match handler.handle(message).await {
        Ok(()) => {
            if mode != TransactionalMode::ManualAcknowledgement {
                store.ack(id).await?;
                if let Some(m) = metrics {
                    m.record_ack(&queue_name);
                }
            }
            Ok(())
        }
        Err(e) => {
            let error_text = e.to_string();
            if policy.is_exhausted(redelivery_attempts) {
                let result = store.mark_dead_letter(id, &error_text).await;
                if result.is_ok() {
                    if let Some(m) = metrics {
                        m.record_dead_letter(&queue_name);
                    }
                }
                result
            } else {
                let delay = policy.delay(redelivery_attempts);
                let next_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                let result = store.reschedule(id, next_at, &error_text, true).await;
                if result.is_ok() {
                    if let Some(m) = metrics {
                        m.record_reschedule(&queue_name);
                    }
                }
                result
            }
        }
    }
}

/// Sleeps for `optimizer.next_interval()`, waking early on a change
/// notification or a cancel request — whichever comes first. A change
/// notification also resets the optimizer to its base interval, matching
/// the spec's "wake signal resets I ← I0" rule rather than just cutting the
/// current sleep short.
async fn wait_for_next_poll(
    optimizer: &PollingOptimizer,
    cancel_flag: &AtomicBool,
    cancel_notify: &Notify,
    wake_rx: Option<&mut tokio::sync::broadcast::Receiver<crate::notifier::ChangeEvent>>,
) {
    if cancel_flag.load(Ordering::SeqCst) {
        return;
    }

    let interval = optimizer.next_interval();
    match wake_rx {
        Some(rx) => {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel_notify.notified() => {}
                recv = rx.recv() => {
                    optimizer.wake();
                    if recv.is_err() {
                        // Lagged or closed: fall through as if woken, the
                        // next poll will just find nothing due.
                    }
                }
            }
        }
        None => {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel_notify.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ClosureHandler, HandlerError};
    use relayq_core::NewMessage;
    use relayq_store::InMemoryMessageStore;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[tokio::test]
    async fn subscription_delivers_a_simple_message_and_cancels_cleanly() {
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        store.insert(NewMessage::new("q", "text/plain", "hi"), None).await.unwrap();

        let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let received_clone = received.clone();
        let handler = Arc::new(ClosureHandler::new(move |msg| {
            let received = received_clone.clone();
            async move {
                received.lock().unwrap().push(String::from_utf8(msg.payload_bytes.to_vec()).unwrap());
                Ok(())
            }
        }));

        let pool = WorkerPool::new(store.clone(), None);
        let handle = pool.subscribe(SubscriptionSpec {
            queue_name: "q".to_string(),
            redelivery_policy: RedeliveryPolicy::fixed(Duration::from_millis(50), 3),
            parallel_consumers: 1,
            handler,
            transactional_mode: TransactionalMode::SingleOperationTransaction,
            base_polling_interval: Duration::from_millis(10),
            max_polling_interval: Duration::from_millis(50),
            polling_delay_increment_factor: 2.0,
            metrics: None,
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        pool.drain(Duration::from_secs(1)).await;

        assert_eq!(received.lock().unwrap().as_slice(), ["hi"]);
        assert_eq!(store.count_queued("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_handler_reschedules_until_exhausted_then_dead_letters() {
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let id = store.insert(NewMessage::new("q", "text/plain", "x"), None).await.unwrap();

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let handler = Arc::new(ClosureHandler::new(move |_msg| {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::from("nope"))
            }
        }));

        let pool = WorkerPool::new(store.clone(), None);
        let handle = pool.subscribe(SubscriptionSpec {
            queue_name: "q".to_string(),
            redelivery_policy: RedeliveryPolicy::fixed(Duration::from_millis(10), 2),
            parallel_consumers: 1,
            handler,
            transactional_mode: TransactionalMode::SingleOperationTransaction,
            base_polling_interval: Duration::from_millis(5),
            max_polling_interval: Duration::from_millis(20),
            polling_delay_increment_factor: 2.0,
            metrics: None,
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.cancel();
        pool.drain(Duration::from_secs(1)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(store.get_dead_letter(id).await.unwrap().is_some());
        assert_eq!(store.count_queued("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn manual_acknowledgement_mode_leaves_settling_to_the_handler() {
        let store: Arc<dyn MessageStore> = Arc::new(InMemoryMessageStore::new());
        let id = store.insert(NewMessage::new("q", "text/plain", "x"), None).await.unwrap();

        let handler = Arc::new(ClosureHandler::new(|_msg| async { Ok(()) }));

        let pool = WorkerPool::new(store.clone(), None);
        let handle = pool.subscribe(SubscriptionSpec {
            queue_name: "q".to_string(),
            redelivery_policy: RedeliveryPolicy::fixed(Duration::from_millis(10), 2),
            parallel_consumers: 1,
            handler,
            transactional_mode: TransactionalMode::ManualAcknowledgement,
            base_polling_interval: Duration::from_millis(5),
            max_polling_interval: Duration::from_millis(20),
            polling_delay_increment_factor: 2.0,
            metrics: None,
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.cancel();
        pool.drain(Duration::from_secs(1)).await;

        // The handler returned Ok, but in manual-ack mode the worker never
        // calls `ack` itself — the row is still present until the caller
        // acks it explicitly.
        assert!(store.get(id).await.unwrap().is_some());
    }
}
