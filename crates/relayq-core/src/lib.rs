//! Shared types for the relayq durable queue engine: the message record,
//! configuration, error taxonomy, and redelivery policy. Kept dependency-
//! light and database-agnostic so `relayq-store` and `relayq` can both
//! depend on it without pulling an async runtime into pure data types.

pub mod config;
pub mod error;
pub mod message;
pub mod retry;

pub use config::{DatabaseConfig, LoggingConfig, QueueEngineConfig, TransactionalMode};
pub use error::{Error, Result};
pub use message::{DeliveryMode, Message, NewMessage, OrderingKey, QueuedMessage};
pub use retry::RedeliveryPolicy;
