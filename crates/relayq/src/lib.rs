//! `relayq`: a durable, Postgres-backed message queue engine built on
//! `relayq-store`'s `MessageStore` contract. At-least-once delivery,
//! per-key strict ordering with head-of-line blocking through dead-letter
//! state, fixed/linear/exponential redelivery, and an explicit dead-letter
//! resurrection path.
//!
//! [`QueueEngine`] is the single entry point: construct it with a store and
//! a [`relayq_core::QueueEngineConfig`], `start()` it, `enqueue` messages
//! from producers, and `consume` them from one or more subscriptions.

pub mod engine;
pub mod handler;
pub mod metrics;
pub mod notifier;
pub mod optimizer;
pub mod worker;

pub use engine::{ConsumeSpec, QueueEngine};
pub use handler::{ClosureHandler, Handler, HandlerError, HandlerFn, HandlerResult};
pub use metrics::{QueueLabels, QueueMetrics};
pub use notifier::{BroadcastChangeNotifier, ChangeEvent, ChangeNotifier, ChangeOperation, PostgresChangeNotifier};
pub use optimizer::PollingOptimizer;
pub use worker::{SubscriptionHandle, SubscriptionSpec, WorkerPool};

pub use relayq_core::{
    DatabaseConfig, DeliveryMode, Error, LoggingConfig, Message, NewMessage, OrderingKey,
    QueueEngineConfig, QueuedMessage, RedeliveryPolicy, Result, TransactionalMode,
};
pub use relayq_store::{InMemoryMessageStore, MessageStore, PostgresMessageStore, SortOrder};
