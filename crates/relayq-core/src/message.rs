//! Message record and the lifecycle fields tracked for it.
//!
//! The split between a lean producer-facing `NewMessage` and the full
//! `Message` record keeps what a caller constructs separate from what the
//! store hands back.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a message participates in per-key strict ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Normal,
    Ordered,
}

impl DeliveryMode {
    pub fn is_ordered(&self) -> bool {
        matches!(self, DeliveryMode::Ordered)
    }
}

impl From<String> for DeliveryMode {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ordered" => DeliveryMode::Ordered,
            _ => DeliveryMode::Normal,
        }
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryMode::Normal => write!(f, "normal"),
            DeliveryMode::Ordered => write!(f, "ordered"),
        }
    }
}

/// The ordering key for an `ordered` message: `(key, key_order)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingKey {
    pub key: String,
    pub key_order: i64,
}

/// Producer input to `MessageStore::insert`/`QueueEngine::enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    pub queue_name: String,
    pub payload_bytes: bytes::Bytes,
    pub payload_type: String,
    pub metadata: HashMap<String, String>,
    pub ordering: Option<OrderingKey>,
}

impl NewMessage {
    pub fn new(
        queue_name: impl Into<String>,
        payload_type: impl Into<String>,
        payload_bytes: impl Into<bytes::Bytes>,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            payload_bytes: payload_bytes.into(),
            payload_type: payload_type.into(),
            metadata: HashMap::new(),
            ordering: None,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn ordered(mut self, key: impl Into<String>, key_order: i64) -> Self {
        self.ordering = Some(OrderingKey {
            key: key.into(),
            key_order,
        });
        self
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.ordering.is_some() {
            DeliveryMode::Ordered
        } else {
            DeliveryMode::Normal
        }
    }
}

/// The full durable message record, as persisted by the store and handed to
/// consumer handlers.
///
/// Handlers are given this same shape under the name `QueuedMessage` (see
/// the type alias below) — there is no separate wire format for the two;
/// they are the same snapshot taken at different points in its life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub queue_name: String,
    pub payload_bytes: bytes::Bytes,
    pub payload_type: String,
    pub metadata: HashMap<String, String>,
    pub added_at: DateTime<Utc>,
    pub next_delivery_at: DateTime<Utc>,
    pub delivery_attempts: i32,
    pub redelivery_attempts: i32,
    pub last_delivery_error: Option<String>,
    pub is_dead_letter: bool,
    pub delivery_mode: DeliveryMode,
    pub key: Option<String>,
    pub key_order: Option<i64>,
}

/// Handler-facing alias. Kept distinct so handler signatures read in terms
/// of "the message a consumer was just handed" rather than the storage type.
pub type QueuedMessage = Message;

impl Message {
    pub fn ordering(&self) -> Option<OrderingKey> {
        match (&self.key, self.key_order) {
            (Some(key), Some(key_order)) => Some(OrderingKey {
                key: key.clone(),
                key_order,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::faker::lorem::en::Paragraph;
    use fake::Fake;

    /// A throwaway fixture payload; this test only asserts on metadata, not
    /// on payload content.
    fn fake_new_message(queue: &str) -> NewMessage {
        let payload: String = Paragraph(1..3).fake();
        NewMessage::new(queue, "text/plain", payload)
    }

    #[test]
    fn with_metadata_attaches_correlation_fields_regardless_of_payload() {
        let mut metadata = HashMap::new();
        metadata.insert("correlation_id".to_string(), "abc-123".to_string());

        let msg = fake_new_message("orders").with_metadata(metadata.clone());
        assert_eq!(msg.metadata, metadata);
        assert_eq!(msg.delivery_mode(), DeliveryMode::Normal);
    }

    #[test]
    fn new_message_without_ordering_is_normal() {
        let msg = NewMessage::new("orders", "text/plain", "hello");
        assert_eq!(msg.delivery_mode(), DeliveryMode::Normal);
    }

    #[test]
    fn new_message_with_ordering_is_ordered() {
        let msg = NewMessage::new("orders", "text/plain", "hello").ordered("customer-42", 3);
        assert_eq!(msg.delivery_mode(), DeliveryMode::Ordered);
        assert_eq!(msg.ordering.as_ref().unwrap().key_order, 3);
    }

    #[test]
    fn delivery_mode_round_trips_through_string() {
        assert_eq!(DeliveryMode::from("ordered".to_string()), DeliveryMode::Ordered);
        assert_eq!(DeliveryMode::from("normal".to_string()), DeliveryMode::Normal);
        assert_eq!(DeliveryMode::from("garbage".to_string()), DeliveryMode::Normal);
    }
}
