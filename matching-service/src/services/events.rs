//! Match event publishing.
//!
//! Downstream consumers (the review inbox, audit trail, notification
//! fan-out) observe match state changes through these events. Publishing
//! is best effort from the engine's point of view: a failed publish is
//! logged and never rolls back the state change it describes.

use async_trait::async_trait;
use service_core::error::AppError;
use std::sync::Mutex;
use tracing::info;

use crate::models::MatchEvent;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &MatchEvent) -> Result<(), AppError>;
}

/// Publisher that emits events as structured log records.
pub struct LogEventPublisher;

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish(&self, event: &MatchEvent) -> Result<(), AppError> {
        info!(
            event = event.kind.as_str(),
            team_id = %event.team_id,
            transaction_id = ?event.transaction_id,
            document_id = %event.document_id,
            combined_score = ?event.combined_score,
            from_currency = ?event.from_currency,
            to_currency = ?event.to_currency,
            decided_utc = %event.decided_utc,
            "Match event"
        );
        Ok(())
    }
}

/// Publisher that records events in memory for test assertions.
#[derive(Default)]
pub struct CapturingEventPublisher {
    events: Mutex<Vec<MatchEvent>>,
}

impl CapturingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MatchEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventPublisher for CapturingEventPublisher {
    async fn publish(&self, event: &MatchEvent) -> Result<(), AppError> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}
