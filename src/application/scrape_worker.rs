//! 스크랩 워커 - one fetch-to-persist cycle per entity
//!
//! The worker claims a QUEUED entity, fetches it and either records a failure
//! transition or runs the content pipeline. Content and policy are persisted in
//! two separate transactions so a slow scorer never holds the content write.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::application::content_metrics;
use crate::application::link_discovery::LinkDiscovery;
use crate::application::policy::PolicyEvaluator;
use crate::domain::entities::{Entity, NewSnapshot, ScrapingStatus};
use crate::domain::repositories::Repositories;
use crate::domain::retry_state::{FailureKind, RetryPolicy};
use crate::domain::services::{
    ContentClassifier, FetchError, Fetcher, HtmlCleaner, HttpResponse, PageParser,
};

/// Entity type given to entities that never had one classified
pub const DEFAULT_ENTITY_TYPE: &str = "page";

/// External collaborators the worker talks to
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub cleaner: Arc<dyn HtmlCleaner>,
    pub classifier: Arc<dyn ContentClassifier>,
    pub parser: Arc<dyn PageParser>,
}

/// What one worker run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScrapeOutcome {
    /// Entity was not QUEUED; nothing written
    Skipped,
    Succeeded { version: u32 },
    Failed {
        status: ScrapingStatus,
        attempts: u32,
        exhausted: bool,
    },
}

pub struct ScrapeWorker {
    repos: Repositories,
    collaborators: Collaborators,
    policy: Arc<dyn PolicyEvaluator>,
    retry: RetryPolicy,
    discovery: Option<LinkDiscovery>,
    description_limit: usize,
}

impl ScrapeWorker {
    pub fn new(
        repos: Repositories,
        collaborators: Collaborators,
        policy: Arc<dyn PolicyEvaluator>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            repos,
            collaborators,
            policy,
            retry,
            discovery: None,
            description_limit: 1024,
        }
    }

    #[must_use]
    pub fn with_discovery(mut self, discovery: LinkDiscovery) -> Self {
        self.discovery = Some(discovery);
        self
    }

    #[must_use]
    pub fn with_description_limit(mut self, limit: usize) -> Self {
        self.description_limit = limit;
        self
    }

    /// Runs one cycle for `entity_id`
    ///
    /// Fetch and collaborator failures end up as failure snapshots; only
    /// storage errors are returned.
    pub async fn run(&self, entity_id: &str) -> Result<ScrapeOutcome> {
        let Some(entity) = self.repos.entities.claim_for_fetch(entity_id).await? else {
            debug!(entity_id, "Entity is not queued; skipping stale dispatch");
            return Ok(ScrapeOutcome::Skipped);
        };

        debug!(entity_id, url = entity.url(), "🌐 Fetching");
        let started = Instant::now();
        let fetched = self.collaborators.fetcher.fetch(entity.url()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match fetched {
            Ok(response) if response.status_code >= 400 => {
                let kind = FailureKind::HttpStatus(response.status_code);
                self.record_failure(&entity, kind, None, duration_ms).await
            }
            Ok(response) => {
                let processed = self.process_content(&entity, &response, duration_ms).await;
                match processed {
                    Ok(version) => Ok(ScrapeOutcome::Succeeded { version }),
                    Err(e) => {
                        warn!(entity_id, "⚠️ Content pipeline failed: {:#}", e);
                        // tx1 may already have reset attempts
                        let current = self
                            .repos
                            .entities
                            .find_by_id(entity_id)
                            .await?
                            .unwrap_or(entity);
                        let kind = FailureKind::Unexpected(format!("{e:#}"));
                        self.record_failure(&current, kind, Some(response.status_code), duration_ms)
                            .await
                    }
                }
            }
            Err(FetchError::Connect(msg)) => {
                self.record_failure(&entity, FailureKind::Network(msg), None, duration_ms)
                    .await
            }
            Err(FetchError::Other(msg)) => {
                self.record_failure(&entity, FailureKind::Unexpected(msg), None, duration_ms)
                    .await
            }
        }
    }

    /// Records a failed attempt for a cycle that died mid-way
    ///
    /// Applies only while the entity is FETCHING, or SUCCESS with no
    /// `next_due` (content stored, policy never ran).
    pub async fn abandon(&self, entity_id: &str) -> Result<Option<ScrapeOutcome>> {
        let Some(entity) = self.repos.entities.find_by_id(entity_id).await? else {
            return Ok(None);
        };
        let interrupted = entity.status == ScrapingStatus::Fetching
            || (entity.status == ScrapingStatus::Success && entity.next_due.is_none());
        if !interrupted {
            return Ok(None);
        }

        let kind = FailureKind::Unexpected("scrape cycle panicked".to_string());
        self.record_failure(&entity, kind, None, 0).await.map(Some)
    }

    async fn record_failure(
        &self,
        entity: &Entity,
        kind: FailureKind,
        http_status: Option<u16>,
        duration_ms: u64,
    ) -> Result<ScrapeOutcome> {
        let transition = self.retry.on_failure(entity.attempts, &kind, Utc::now());
        let snapshot = NewSnapshot::failure(
            entity.id.clone(),
            transition.status,
            kind.http_status().or(http_status),
            duration_ms,
            kind.message(),
        );

        self.repos
            .snapshots
            .record_failure(entity, snapshot, &transition)
            .await?;

        if transition.is_exhausted() {
            warn!(
                entity_id = %entity.id,
                status = %transition.status,
                attempts = transition.attempts,
                "💤 Retries exhausted; entity is dormant"
            );
        } else {
            info!(
                entity_id = %entity.id,
                status = %transition.status,
                attempts = transition.attempts,
                "❌ Scrape failed: {}",
                kind.message()
            );
        }

        Ok(ScrapeOutcome::Failed {
            status: transition.status,
            attempts: transition.attempts,
            exhausted: transition.is_exhausted(),
        })
    }

    /// Clean → classify + parse → persist content → discover → evaluate → persist policy
    async fn process_content(
        &self,
        entity: &Entity,
        response: &HttpResponse,
        duration_ms: u64,
    ) -> Result<u32> {
        let cleaned = self.collaborators.cleaner.clean(&response.body);
        let (classification, page) = tokio::try_join!(
            self.collaborators.classifier.classify(&cleaned),
            self.collaborators.parser.parse(&cleaned, &response.final_url),
        )?;

        let previous_markdown = self
            .repos
            .snapshots
            .latest_successful_markdown(&entity.id)
            .await?;
        let metrics = content_metrics::compute(
            &page.markdown_content,
            page.linked_page_urls.len(),
            &response.body,
            previous_markdown.as_deref(),
        );

        let mut updated = entity.clone();
        if updated.entity_type.is_none() {
            updated.entity_type = Some(DEFAULT_ENTITY_TYPE.to_string());
        }
        updated.content_type = classification.content_type.or(updated.content_type);
        updated.page_type = classification.page_type.or(updated.page_type);
        updated.temporal_class = classification.temporal.or(updated.temporal_class);
        if !classification.tags.is_empty() {
            updated.tags = classification.tags;
        }
        updated.description = classification
            .description
            .or(page.excerpt)
            .map(|text| content_metrics::truncate_description(&text, self.description_limit))
            .or(updated.description);
        updated.title = page.title.or(updated.title);
        updated.thumbnail_url = page.thumbnail_url.or(updated.thumbnail_url);
        updated.canonical_url = page.canonical_url.or(updated.canonical_url);
        updated.canonical_number = page.canonical_number.or(updated.canonical_number);
        updated.published_at = page.published_at.or(updated.published_at);
        updated.content_updated_at = page.updated_at.or(updated.content_updated_at);

        let snapshot = NewSnapshot {
            entity_id: entity.id.clone(),
            status: ScrapingStatus::Success,
            http_status: Some(response.status_code),
            metrics,
            fetch_duration_ms: duration_ms,
            cost: classification.cost + page.cost,
            error: None,
            content_hash: Some(content_metrics::content_hash(&page.markdown_content)),
            markdown: Some(page.markdown_content),
        };

        let stored = self
            .repos
            .snapshots
            .persist_content(&updated, snapshot)
            .await
            .context("Failed to persist scraped content")?;
        info!(
            entity_id = %entity.id,
            version = stored.version,
            content_length = stored.metrics.content_length,
            "✅ Content stored"
        );

        if let Some(discovery) = &self.discovery {
            if let Err(e) = discovery.discover(entity, &page.linked_page_urls).await {
                warn!(entity_id = %entity.id, "🔗 Link discovery failed: {:#}", e);
            }
        }

        self.evaluate_policy(&entity.id).await?;
        Ok(stored.version)
    }

    async fn evaluate_policy(&self, entity_id: &str) -> Result<()> {
        let entity = self
            .repos
            .entities
            .find_by_id(entity_id)
            .await?
            .with_context(|| format!("Entity {entity_id} vanished before policy evaluation"))?;

        let window = self.policy.history_window();
        let history = if window > 0 {
            self.repos.snapshots.recent_for_entity(entity_id, window).await?
        } else {
            Vec::new()
        };
        let source = self.repos.sources.find_by_id(&entity.source_id).await?;

        let result = self
            .policy
            .evaluate(&entity, &history, source.as_ref(), Utc::now())
            .await
            .with_context(|| format!("Policy '{}' failed", self.policy.name()))?;

        self.repos.snapshots.persist_policy(entity_id, &result).await?;
        debug!(
            entity_id,
            policy = self.policy.name(),
            next_visit_at = %result.next_visit_at(),
            "📅 Next visit scheduled"
        );
        Ok(())
    }
}
