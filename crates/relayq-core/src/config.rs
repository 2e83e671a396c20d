//! Engine configuration: a top-level struct composed of nested, serde-derived
//! sections, each with a `Default`, plus `_secs`-suffixed fields with a
//! `Duration`-returning accessor.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The three transactional modes a queue engine embedding may operate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionalMode {
    /// Enqueue joins the caller's transaction; delivery+ack is one
    /// transaction per message. Requires a transaction factory.
    FullyTransactional,
    /// The engine opens its own transaction per operation. Default for
    /// simpler embeddings.
    SingleOperationTransaction,
    /// The engine manages the transaction but the handler must call `ack`
    /// explicitly within `message_handling_timeout`.
    ManualAcknowledgement,
}

impl Default for TransactionalMode {
    fn default() -> Self {
        TransactionalMode::SingleOperationTransaction
    }
}

/// Database connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_min_connections: u32,
    pub pool_max_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/relayq".to_string(),
            pool_min_connections: 1,
            pool_max_connections: 10,
            connect_timeout_secs: 30,
            idle_timeout_secs: 600,
        }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Logging configuration. The engine never calls `tracing_subscriber::init`
/// itself (it only emits events); this section exists so an embedding
/// binary/test harness can build a subscriber from the same values the
/// engine was configured with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEngineConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,

    /// Name of the shared queue table.
    pub shared_queue_table_name: String,
    /// Max in-flight lease duration before a claim is reclaimable.
    pub message_handling_timeout_secs: u64,
    /// One of the three transactional modes the engine supports.
    pub transactional_mode: TransactionalMode,
    /// Polling optimizer's increment factor `f` (must be > 1.0).
    pub polling_delay_increment_factor: f64,
    /// Polling optimizer's ceiling `I_max`, in milliseconds.
    pub max_polling_interval_ms: u64,
    /// Polling optimizer's base interval `I0`, in milliseconds.
    pub base_polling_interval_ms: u64,
    /// Enables per-poll debug tracing events (claim misses, interval
    /// changes) that are too chatty for steady-state production logs.
    pub verbose_tracing: bool,
    /// How long `QueueEngine::stop` waits for in-flight handlers to drain
    /// before releasing their claims unconditionally.
    pub drain_timeout_secs: u64,
}

impl Default for QueueEngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            shared_queue_table_name: "relayq_messages".to_string(),
            message_handling_timeout_secs: 300,
            transactional_mode: TransactionalMode::default(),
            polling_delay_increment_factor: 2.0,
            max_polling_interval_ms: 30_000,
            base_polling_interval_ms: 250,
            verbose_tracing: false,
            drain_timeout_secs: 30,
        }
    }
}

impl QueueEngineConfig {
    pub fn message_handling_timeout(&self) -> Duration {
        Duration::from_secs(self.message_handling_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn base_polling_interval(&self) -> Duration {
        Duration::from_millis(self.base_polling_interval_ms)
    }

    pub fn max_polling_interval(&self) -> Duration {
        Duration::from_millis(self.max_polling_interval_ms)
    }

    /// Load configuration from the layered `config` crate sources: built-in
    /// defaults, an optional `relayq.toml`/`relayq.yaml` file, then
    /// `RELAYQ_`-prefixed environment variables. Embeddings that only need
    /// programmatic construction can skip this and build the struct (or its
    /// `Default`) directly.
    pub fn load() -> Result<Self> {
        let defaults = Self::default();
        let defaults_json = serde_json::to_value(&defaults)
            .map_err(|e| Error::configuration(format!("default config is unrepresentable: {e}")))?;

        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults_json).map_err(|e| {
                Error::configuration(format!("failed to seed config defaults: {e}"))
            })?)
            .add_source(config::File::with_name("relayq").required(false))
            .add_source(config::Environment::with_prefix("RELAYQ").separator("__"));

        let loaded = builder
            .build()
            .map_err(|e| Error::configuration(format!("failed to build config: {e}")))?;

        loaded
            .try_deserialize()
            .map_err(|e| Error::configuration(format!("failed to deserialize config: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.shared_queue_table_name.trim().is_empty() {
            return Err(Error::configuration(
                "shared_queue_table_name must not be empty",
            ));
        }
        if self.polling_delay_increment_factor <= 1.0 {
            return Err(Error::configuration(
                "polling_delay_increment_factor must be greater than 1.0",
            ));
        }
        if self.base_polling_interval_ms == 0 {
            return Err(Error::configuration(
                "base_polling_interval_ms must be greater than 0",
            ));
        }
        if self.max_polling_interval_ms < self.base_polling_interval_ms {
            return Err(Error::configuration(
                "max_polling_interval_ms must be >= base_polling_interval_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(QueueEngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_increment_factor() {
        let mut cfg = QueueEngineConfig::default();
        cfg.polling_delay_increment_factor = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_polling_bounds() {
        let mut cfg = QueueEngineConfig::default();
        cfg.max_polling_interval_ms = 10;
        cfg.base_polling_interval_ms = 250;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duration_helpers_match_secs_fields() {
        let cfg = QueueEngineConfig::default();
        assert_eq!(cfg.drain_timeout(), Duration::from_secs(30));
        assert_eq!(
            cfg.message_handling_timeout(),
            Duration::from_secs(cfg.message_handling_timeout_secs)
        );
    }
}
