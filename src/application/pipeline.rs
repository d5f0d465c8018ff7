//! 파이프라인 조립 - wires storage, collaborators, queue and loops together
//!
//! Startup order: reset orphaned in-flight entities, seed sources, start the
//! count aggregator and the queue workers, then start the safety-net tickers
//! for the scheduler and the sweep.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::entity_counts::EntityCountAggregator;
use crate::application::link_discovery::LinkDiscovery;
use crate::application::policy::{DefaultPolicy, PolicyEvaluator, SignalDecayPolicy};
use crate::application::scheduler::{Scheduler, SCHEDULER_JOB_KEY};
use crate::application::scrape_worker::{Collaborators, ScrapeWorker};
use crate::application::source_sweep::{SourceSweep, SWEEP_JOB_KEY};
use crate::application::work_queue::{Job, JobHandler, WorkQueue};
use crate::domain::entities::Source;
use crate::domain::events::EventBus;
use crate::domain::repositories::Repositories;
use crate::domain::retry_state::RetryPolicy;
use crate::infrastructure::config::{AppConfig, PolicyConfig, PolicyKind};
use crate::infrastructure::{
    sqlite_repositories, DatabaseConnection, HttpPolicyScorer, MetaTagClassifier,
    RegexHtmlCleaner, ReqwestFetcher, ScraperPageParser, SqliteLockStore,
};

/// Reqwest fetcher plus the built-in HTML collaborators
pub fn default_collaborators(config: &AppConfig) -> Result<Collaborators> {
    Ok(Collaborators {
        fetcher: Arc::new(ReqwestFetcher::new(&config.fetch)?),
        cleaner: Arc::new(RegexHtmlCleaner),
        classifier: Arc::new(MetaTagClassifier),
        parser: Arc::new(ScraperPageParser),
    })
}

/// Policy evaluator selected by `policy.kind`
pub fn build_policy(config: &PolicyConfig) -> Result<Arc<dyn PolicyEvaluator>> {
    match config.kind {
        PolicyKind::Default => Ok(Arc::new(DefaultPolicy::new(config.default_interval()))),
        PolicyKind::SignalDecay => {
            let scorer = HttpPolicyScorer::from_config(config)?
                .context("signal_decay policy needs policy.scorer_url")?;
            Ok(Arc::new(SignalDecayPolicy::new(
                Arc::new(scorer),
                config.default_interval(),
                config.history_window,
            )))
        }
    }
}

/// Routes queue jobs to the worker and the two loops
struct PipelineJobs {
    worker: Arc<ScrapeWorker>,
    scheduler: Arc<Scheduler>,
    sweep: Arc<SourceSweep>,
}

#[async_trait]
impl JobHandler for PipelineJobs {
    async fn handle(&self, job: Job) -> Result<()> {
        match job {
            Job::Scrape { entity_id } => {
                self.worker.run(&entity_id).await?;
            }
            Job::RunScheduler => {
                self.scheduler.run_once().await?;
            }
            Job::RunSweep => {
                self.sweep.run_once().await?;
            }
        }
        Ok(())
    }

    async fn on_panic(&self, job: Job) -> Result<()> {
        if let Job::Scrape { entity_id } = job {
            self.worker.abandon(&entity_id).await?;
        }
        Ok(())
    }
}

pub struct Pipeline {
    config: AppConfig,
    repos: Repositories,
    events: EventBus,
    queue: Arc<WorkQueue>,
    worker: Arc<ScrapeWorker>,
    scheduler: Arc<Scheduler>,
    sweep: Arc<SourceSweep>,
    cancellation_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    /// Opens the database and builds the default collaborators
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let db = DatabaseConnection::new(&config.database).await?;
        db.migrate().await?;

        let collaborators = default_collaborators(&config)?;
        let policy = build_policy(&config.policy)?;
        Ok(Self::new(config, db.pool().clone(), collaborators, policy))
    }

    /// Builds the pipeline on an already migrated pool
    pub fn new(
        config: AppConfig,
        pool: SqlitePool,
        collaborators: Collaborators,
        policy: Arc<dyn PolicyEvaluator>,
    ) -> Self {
        let events = EventBus::default();
        let repos = sqlite_repositories(pool.clone(), events.clone());
        let queue = Arc::new(WorkQueue::new(config.queue.clone()));

        let mut worker = ScrapeWorker::new(
            repos.clone(),
            collaborators,
            policy,
            RetryPolicy::new(config.retry.max_attempts),
        )
        .with_description_limit(config.discovery.description_limit);
        if config.discovery.enabled {
            worker = worker.with_discovery(LinkDiscovery::new(
                Arc::clone(&repos.entities),
                config.discovery.max_links_per_page,
            ));
        }

        let scheduler = Scheduler::new(
            Arc::clone(&repos.entities),
            Arc::new(SqliteLockStore::new(pool)),
            Arc::clone(&queue),
            config.scheduler.clone(),
        );
        let sweep = SourceSweep::new(
            repos.clone(),
            Arc::clone(&queue),
            config.sweep.clone(),
            config.retry.max_attempts,
        );

        Self {
            config,
            repos,
            events,
            queue,
            worker: Arc::new(worker),
            scheduler: Arc::new(scheduler),
            sweep: Arc::new(sweep),
            cancellation_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Upserts the configured seed sources; returns how many were applied
    pub async fn seed_sources(&self) -> Result<usize> {
        for seed in &self.config.seed_sources {
            let source = Source::new(seed.name.clone(), seed.base_url.clone())
                .with_weights(seed.authority_score, seed.priority_weight);
            self.repos.sources.upsert_by_base_url(&source).await?;
            info!("🌱 Seed source ready: {} ({})", seed.name, seed.base_url);
        }
        Ok(self.config.seed_sources.len())
    }

    /// Puts a dormant entity back in the PENDING pool
    pub async fn reset_entity(&self, entity_id: &str) -> Result<bool> {
        let reset = self.repos.entities.reset_entity(entity_id).await?;
        if reset {
            info!(entity_id, "♻️ Entity reset to pending");
            self.scheduler.trigger().await;
        }
        Ok(reset)
    }

    pub async fn start(&self) -> Result<()> {
        info!("🚀 Starting scrape pipeline");

        let recovered = self.repos.entities.reset_in_flight().await?;
        if recovered > 0 {
            warn!("♻️ Reset {} entities orphaned in queued/fetching", recovered);
        }
        self.seed_sources().await?;

        let mut handles = self.handles.lock().await;
        handles.push(
            EntityCountAggregator::new(Arc::clone(&self.repos.sources))
                .spawn(&self.events, self.cancellation_token.clone()),
        );

        let jobs: Arc<dyn JobHandler> = Arc::new(PipelineJobs {
            worker: Arc::clone(&self.worker),
            scheduler: Arc::clone(&self.scheduler),
            sweep: Arc::clone(&self.sweep),
        });
        handles.extend(self.queue.start(jobs));

        handles.push(self.spawn_ticker(
            Job::RunScheduler,
            SCHEDULER_JOB_KEY,
            self.config.scheduler.tick_interval(),
        ));
        handles.push(self.spawn_ticker(Job::RunSweep, SWEEP_JOB_KEY, self.config.sweep.interval()));

        info!(
            workers = self.config.queue.workers,
            max_scrape_depth = self.config.queue.max_scrape_depth,
            "✅ Scrape pipeline running"
        );
        Ok(())
    }

    /// External fixed-interval trigger; the first tick fires immediately
    fn spawn_ticker(&self, job: Job, key: &'static str, period: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let cancel = self.cancellation_token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        queue.dispatch_unique(job.clone(), key, Duration::ZERO).await;
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        info!("🛑 Stopping scrape pipeline");
        self.cancellation_token.cancel();
        self.queue.shutdown().await;

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Pipeline task ended abnormally: {}", e);
            }
        }
        info!("✅ Scrape pipeline stopped");
    }
}
