//! 스케줄러 루프 - picks due entities and dispatches scrape jobs
//!
//! Two independent guards keep the loop single: the unique job key allows at
//! most one queued or delayed pass, and the TTL execution lock allows at most
//! one running pass across processes sharing the database.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::work_queue::{Job, WorkQueue};
use crate::domain::entities::ScrapingStatus;
use crate::domain::repositories::EntityRepository;
use crate::infrastructure::config::SchedulerConfig;
use crate::infrastructure::lock_store::LockStore;

pub const SCHEDULER_LOCK: &str = "scrape-scheduler";
pub const SCHEDULER_JOB_KEY: &str = "job:scrape-scheduler";

/// Result of one scheduler pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerPass {
    pub lock_acquired: bool,
    pub selected: usize,
    pub dispatched: usize,
}

pub struct Scheduler {
    entities: Arc<dyn EntityRepository>,
    locks: Arc<dyn LockStore>,
    queue: Arc<WorkQueue>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        entities: Arc<dyn EntityRepository>,
        locks: Arc<dyn LockStore>,
        queue: Arc<WorkQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            entities,
            locks,
            queue,
            config,
        }
    }

    /// Queues a pass now unless one is already queued or delayed
    pub async fn trigger(&self) -> bool {
        self.queue
            .dispatch_unique(Job::RunScheduler, SCHEDULER_JOB_KEY, Duration::ZERO)
            .await
    }

    /// One pass: lock, select, mark QUEUED, dispatch, unlock, re-trigger
    ///
    /// When the lock is held elsewhere the pass is skipped without
    /// re-triggering; the next tick picks things up.
    pub async fn run_once(&self) -> Result<SchedulerPass> {
        let owner = Uuid::new_v4().to_string();
        if !self
            .locks
            .try_acquire(SCHEDULER_LOCK, &owner, self.config.lock_ttl())
            .await?
        {
            debug!("🔒 Scheduler lock held elsewhere; skipping pass");
            return Ok(SchedulerPass::default());
        }

        let pass = self.dispatch_due().await;

        if let Err(e) = self.locks.release(SCHEDULER_LOCK, &owner).await {
            warn!("Failed to release scheduler lock: {:#}", e);
        }

        let pass = pass?;
        self.queue
            .dispatch_unique(
                Job::RunScheduler,
                SCHEDULER_JOB_KEY,
                self.config.reschedule_delay(),
            )
            .await;
        Ok(pass)
    }

    async fn dispatch_due(&self) -> Result<SchedulerPass> {
        let mut reservation = self
            .queue
            .reserve_scrape_slots(self.config.dispatch_limit as usize);
        if reservation.is_empty() {
            debug!(
                depth = self.queue.scrape_depth(),
                "Scrape queue full; nothing dispatched"
            );
            return Ok(SchedulerPass {
                lock_acquired: true,
                ..SchedulerPass::default()
            });
        }

        let now = Utc::now();
        let budget = reservation.remaining();
        let mut selected: Vec<String> = Vec::new();
        for status in ScrapingStatus::SCHEDULABLE {
            let remaining = budget - selected.len();
            if remaining == 0 {
                break;
            }
            let due = self.entities.find_due(status, now, remaining as u32).await?;
            selected.extend(due.into_iter().map(|entity| entity.id));
        }

        if selected.is_empty() {
            return Ok(SchedulerPass {
                lock_acquired: true,
                ..SchedulerPass::default()
            });
        }

        let queued = self.entities.mark_queued(&selected).await?;
        let mut dispatched = 0;
        for entity_id in queued {
            if self.queue.dispatch_scrape(entity_id, &mut reservation).await {
                dispatched += 1;
            }
        }

        info!(
            selected = selected.len(),
            dispatched,
            depth = self.queue.scrape_depth(),
            "📋 Scheduler pass dispatched scrapes"
        );
        Ok(SchedulerPass {
            lock_acquired: true,
            selected: selected.len(),
            dispatched,
        })
    }
}
