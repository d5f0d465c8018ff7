//! Entity lifecycle events
//!
//! Emitted by the store after a transition has been committed. Subscribers
//! (such as the per-source entity count aggregator) listen on a broadcast bus
//! instead of hooking into persistence directly.

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::entities::ScrapingStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntityEvent {
    Created {
        entity_id: String,
        source_id: String,
        at: DateTime<Utc>,
    },
    StatusChanged {
        entity_id: String,
        source_id: String,
        from: ScrapingStatus,
        to: ScrapingStatus,
        at: DateTime<Utc>,
    },
    SnapshotRecorded {
        entity_id: String,
        source_id: String,
        version: u32,
        status: ScrapingStatus,
        at: DateTime<Utc>,
    },
}

impl EntityEvent {
    #[must_use]
    pub fn source_id(&self) -> &str {
        match self {
            Self::Created { source_id, .. }
            | Self::StatusChanged { source_id, .. }
            | Self::SnapshotRecorded { source_id, .. } => source_id,
        }
    }
}

/// Broadcast bus for entity events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EntityEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.sender.subscribe()
    }

    /// Fire-and-forget; having no subscribers is not an error
    pub fn emit(&self, event: EntityEvent) {
        if self.sender.send(event).is_err() {
            debug!("No event subscribers attached");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(EntityEvent::Created {
            entity_id: "e1".into(),
            source_id: "s1".into(),
            at: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source_id(), "s1");
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::default();
        bus.emit(EntityEvent::Created {
            entity_id: "e1".into(),
            source_id: "s1".into(),
            at: Utc::now(),
        });
    }
}
