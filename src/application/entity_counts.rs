//! Keeps `sources.entity_count` current from entity events

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::events::{EntityEvent, EventBus};
use crate::domain::repositories::SourceRepository;

pub struct EntityCountAggregator {
    sources: Arc<dyn SourceRepository>,
}

impl EntityCountAggregator {
    pub fn new(sources: Arc<dyn SourceRepository>) -> Self {
        Self { sources }
    }

    /// Subscribes now and recounts on every `Created` event until cancelled
    pub fn spawn(self, bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => break,
                    received = events.recv() => received,
                };

                match event {
                    Ok(EntityEvent::Created { source_id, .. }) => self.refresh(&source_id).await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        // counts are recomputed from scratch, so the next event catches up
                        warn!(missed, "Entity count aggregator lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Entity count aggregator stopped");
        })
    }

    async fn refresh(&self, source_id: &str) {
        match self.sources.refresh_entity_count(source_id).await {
            Ok(count) => debug!(source_id, count, "Entity count refreshed"),
            Err(e) => warn!(source_id, "Failed to refresh entity count: {:#}", e),
        }
    }
}
