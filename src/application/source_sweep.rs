//! 소스 스윕 - time-boxed pass over all sources
//!
//! Sources are walked most-recently-updated first in fixed-size chunks. The
//! wall-clock budget is checked once per chunk, so a slow chunk may overrun it.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::application::scrape_worker::DEFAULT_ENTITY_TYPE;
use crate::application::work_queue::WorkQueue;
use crate::domain::entities::{Entity, Source};
use crate::domain::repositories::Repositories;
use crate::domain::value_objects::NormalizedUrl;
use crate::infrastructure::config::SweepConfig;

pub const SWEEP_JOB_KEY: &str = "job:source-sweep";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sources_seen: usize,
    pub entities_created: usize,
    pub dispatched: usize,
    pub budget_exhausted: bool,
}

/// What happened to one source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceAction {
    AlreadyPlanned,
    Skipped,
    QueueFull,
    Dispatched,
}

pub struct SourceSweep {
    repos: Repositories,
    queue: Arc<WorkQueue>,
    config: SweepConfig,
    max_attempts: u32,
}

impl SourceSweep {
    pub fn new(
        repos: Repositories,
        queue: Arc<WorkQueue>,
        config: SweepConfig,
        max_attempts: u32,
    ) -> Self {
        Self {
            repos,
            queue,
            config,
            max_attempts,
        }
    }

    pub async fn run_once(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let chunk_size = u64::from(self.config.chunk_size.max(1));
        let mut report = SweepReport::default();
        let mut offset = 0u64;

        loop {
            if started.elapsed() >= self.config.time_budget() {
                report.budget_exhausted = true;
                warn!(
                    sources_seen = report.sources_seen,
                    "⏱️ Sweep time budget exhausted; stopping early"
                );
                break;
            }

            let chunk = self
                .repos
                .sources
                .list_recently_updated(offset, chunk_size)
                .await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;

            for source in &chunk {
                report.sources_seen += 1;
                match self.ensure_planned(source).await {
                    Ok((action, created)) => {
                        if created {
                            report.entities_created += 1;
                        }
                        if action == SourceAction::Dispatched {
                            report.dispatched += 1;
                        } else {
                            debug!(source_id = %source.id, ?action, "Sweep left source as is");
                        }
                    }
                    Err(e) => warn!(source_id = %source.id, "Sweep failed for source: {:#}", e),
                }
            }

            if (chunk.len() as u64) < chunk_size {
                break;
            }
        }

        info!(
            sources = report.sources_seen,
            dispatched = report.dispatched,
            created = report.entities_created,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "🧹 Source sweep finished"
        );
        Ok(report)
    }

    /// Returns what was done and whether the base entity had to be created
    async fn ensure_planned(&self, source: &Source) -> Result<(SourceAction, bool)> {
        if self
            .repos
            .entities
            .has_planned_scrape(&source.id, self.max_attempts, Utc::now())
            .await?
        {
            return Ok((SourceAction::AlreadyPlanned, false));
        }

        let base_url = NormalizedUrl::parse(&source.base_url)?;
        let (entity, created) = self.find_or_create_base_entity(source, &base_url).await?;

        if entity.status.is_in_flight() || entity.is_dormant(self.max_attempts) {
            return Ok((SourceAction::Skipped, created));
        }

        let mut reservation = self.queue.reserve_scrape_slots(1);
        if reservation.is_empty() {
            debug!(source_id = %source.id, "Scrape queue full; sweep dispatch deferred");
            return Ok((SourceAction::QueueFull, created));
        }

        let queued = self.repos.entities.mark_queued(&[entity.id.clone()]).await?;
        let Some(entity_id) = queued.into_iter().next() else {
            return Ok((SourceAction::Skipped, created));
        };
        if !self.queue.dispatch_scrape(entity_id, &mut reservation).await {
            return Ok((SourceAction::QueueFull, created));
        }

        debug!(source_id = %source.id, entity_id = %entity.id, "🧹 Base URL dispatched");
        Ok((SourceAction::Dispatched, created))
    }

    async fn find_or_create_base_entity(
        &self,
        source: &Source,
        base_url: &NormalizedUrl,
    ) -> Result<(Entity, bool)> {
        let fingerprint = base_url.fingerprint();
        if let Some(entity) = self
            .repos
            .entities
            .find_by_fingerprint(&source.id, &fingerprint)
            .await?
        {
            return Ok((entity, false));
        }

        let entity = Entity::new(source.id.clone(), base_url.as_str())
            .with_entity_type(DEFAULT_ENTITY_TYPE);
        if self.repos.entities.insert(&entity).await? {
            return Ok((entity, true));
        }

        // lost an insert race; use the winner's row
        let existing = self
            .repos
            .entities
            .find_by_fingerprint(&source.id, &fingerprint)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Base entity for {} disappeared", source.base_url))?;
        Ok((existing, false))
    }
}
