//! Event publisher sink.
//!
//! Injected into the coordinator at startup; config-driven swap between
//! NATS (production) and an in-memory recorder (dev/test). Publishing is
//! best-effort and never fails or rolls back the reconciliation that
//! produced the event.

use async_trait::async_trait;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to publish event: {0}")]
    Publish(String),
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// Production publisher backed by NATS.
#[derive(Clone)]
pub struct NatsEventPublisher {
    client: async_nats::Client,
}

impl NatsEventPublisher {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// In-memory publisher for dev and tests; records everything it is handed.
#[derive(Default)]
pub struct InMemoryEventPublisher {
    events: Mutex<Vec<PublishedEvent>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedEvent> {
        self.events.lock().expect("publisher lock poisoned").clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.published().into_iter().map(|e| e.subject).collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        self.events
            .lock()
            .expect("publisher lock poisoned")
            .push(PublishedEvent {
                subject: subject.to_string(),
                payload,
            });
        Ok(())
    }
}
