//! Prometheus metrics for queue activity: lets an embedder wire this engine
//! into an existing `/metrics` endpoint without the engine owning an HTTP
//! server of its own.

use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Per-queue label set shared by every counter and gauge here.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub queue_name: String,
}

/// Queue engine metrics, registered into one `Registry` at construction.
#[derive(Clone)]
pub struct QueueMetrics {
    pub registry: Arc<Registry>,

    /// Messages successfully claimed off a queue.
    pub messages_claimed_total: Family<QueueLabels, Counter>,
    /// Messages acknowledged (deleted) after a successful handler.
    pub messages_acknowledged_total: Family<QueueLabels, Counter>,
    /// Messages rescheduled after a failed handler, not yet exhausted.
    pub messages_rescheduled_total: Family<QueueLabels, Counter>,
    /// Messages moved to the dead letter once their redelivery policy was
    /// exhausted.
    pub messages_dead_lettered_total: Family<QueueLabels, Counter>,
    /// Dead letters resurrected back onto the queue.
    pub messages_resurrected_total: Family<QueueLabels, Counter>,
    /// Current count of ready (non-dead-lettered) messages per queue.
    pub queue_depth: Family<QueueLabels, Gauge>,
}

impl QueueMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let messages_claimed_total = Family::<QueueLabels, Counter>::default();
        registry.register(
            "messages_claimed_total",
            "Total messages claimed off a queue",
            messages_claimed_total.clone(),
        );

        let messages_acknowledged_total = Family::<QueueLabels, Counter>::default();
        registry.register(
            "messages_acknowledged_total",
            "Total messages acknowledged after a successful handler",
            messages_acknowledged_total.clone(),
        );

        let messages_rescheduled_total = Family::<QueueLabels, Counter>::default();
        registry.register(
            "messages_rescheduled_total",
            "Total messages rescheduled after a failed handler",
            messages_rescheduled_total.clone(),
        );

        let messages_dead_lettered_total = Family::<QueueLabels, Counter>::default();
        registry.register(
            "messages_dead_lettered_total",
            "Total messages moved to the dead letter",
            messages_dead_lettered_total.clone(),
        );

        let messages_resurrected_total = Family::<QueueLabels, Counter>::default();
        registry.register(
            "messages_resurrected_total",
            "Total dead letters resurrected back onto a queue",
            messages_resurrected_total.clone(),
        );

        let queue_depth = Family::<QueueLabels, Gauge>::default();
        registry.register(
            "queue_depth",
            "Current count of ready messages per queue",
            queue_depth.clone(),
        );

        Self {
            registry: Arc::new(registry),
            messages_claimed_total,
            messages_acknowledged_total,
            messages_rescheduled_total,
            messages_dead_lettered_total,
            messages_resurrected_total,
            queue_depth,
        }
    }

    fn labels(queue_name: &str) -> QueueLabels {
        QueueLabels {
            queue_name: queue_name.to_string(),
        }
    }

    pub fn record_claim(&self, queue_name: &str) {
        self.messages_claimed_total.get_or_create(&Self::labels(queue_name)).inc();
    }

    pub fn record_ack(&self, queue_name: &str) {
        self.messages_acknowledged_total.get_or_create(&Self::labels(queue_name)).inc();
    }

    pub fn record_reschedule(&self, queue_name: &str) {
        self.messages_rescheduled_total.get_or_create(&Self::labels(queue_name)).inc();
    }

    pub fn record_dead_letter(&self, queue_name: &str) {
        self.messages_dead_lettered_total.get_or_create(&Self::labels(queue_name)).inc();
    }

    pub fn record_resurrection(&self, queue_name: &str) {
        self.messages_resurrected_total.get_or_create(&Self::labels(queue_name)).inc();
    }

    pub fn set_queue_depth(&self, queue_name: &str, depth: i64) {
        self.queue_depth.get_or_create(&Self::labels(queue_name)).set(depth);
    }

    /// Encodes the full registry in Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry).unwrap();
        buffer
    }
}

impl Default for QueueMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_registry_encodes_known_metric_names() {
        let metrics = QueueMetrics::new();
        let encoded = metrics.encode();
        assert!(encoded.contains("messages_claimed_total"));
        assert!(encoded.contains("queue_depth"));
    }

    #[test]
    fn counters_are_scoped_per_queue() {
        let metrics = QueueMetrics::new();
        metrics.record_claim("orders");
        metrics.record_claim("orders");
        metrics.record_claim("shipments");

        let encoded = metrics.encode();
        assert!(encoded.contains("queue_name=\"orders\""));
        assert!(encoded.contains("queue_name=\"shipments\""));
    }

    #[test]
    fn queue_depth_gauge_reflects_latest_set_call() {
        let metrics = QueueMetrics::new();
        metrics.set_queue_depth("orders", 5);
        metrics.set_queue_depth("orders", 3);
        assert!(metrics.encode().contains("queue_depth{queue_name=\"orders\"} 3"));
    }
}
