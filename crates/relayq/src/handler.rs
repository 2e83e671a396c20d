//! The consumer-side handler capability: given a message snapshot, either
//! complete or fail.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use relayq_core::QueuedMessage;

/// A handler failure. Deliberately just a message — the engine only ever
/// records it into `last_delivery_error`, it never inspects the cause.
#[derive(Debug, Clone)]
pub struct HandlerError(pub String);

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        HandlerError(s)
    }
}

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        HandlerError(s.to_string())
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        HandlerError(e.to_string())
    }
}

pub type HandlerResult = std::result::Result<(), HandlerError>;
pub type HandlerFn =
    Arc<dyn Fn(QueuedMessage) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// The single-method capability a subscription dispatches to.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: QueuedMessage) -> HandlerResult;
}

/// Adapts a plain async closure into a `Handler`, so `QueueEngine::consume`
/// callers can pass `|msg| async move { ... }` directly instead of defining
/// a struct.
pub struct ClosureHandler {
    f: HandlerFn,
}

impl ClosureHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(QueuedMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            f: Arc::new(move |msg| Box::pin(f(msg))),
        }
    }
}

#[async_trait]
impl Handler for ClosureHandler {
    async fn handle(&self, message: QueuedMessage) -> HandlerResult {
        (self.f)(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn sample_message() -> QueuedMessage {
        QueuedMessage {
            id: Uuid::now_v7(),
            queue_name: "q".to_string(),
            payload_bytes: bytes::Bytes::from_static(b"x"),
            payload_type: "text/plain".to_string(),
            metadata: HashMap::new(),
            added_at: chrono::Utc::now(),
            next_delivery_at: chrono::Utc::now(),
            delivery_attempts: 1,
            redelivery_attempts: 0,
            last_delivery_error: None,
            is_dead_letter: false,
            delivery_mode: relayq_core::DeliveryMode::Normal,
            key: None,
            key_order: None,
        }
    }

    #[tokio::test]
    async fn closure_handler_invokes_the_closure() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let handler = ClosureHandler::new(move |_msg| {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        handler.handle(sample_message()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closure_handler_propagates_failure() {
        let handler = ClosureHandler::new(|_msg| async { Err(HandlerError::from("boom")) });
        let err = handler.handle(sample_message()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }
}
