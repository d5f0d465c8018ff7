//! Repository interfaces for the scrape pipeline
//!
//! Contains trait definitions for the data access the scheduler, sweep and
//! worker need. SQLite implementations live in the infrastructure layer.

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::entities::{Entity, NewSnapshot, ScrapingStatus, Snapshot, Source};
use crate::domain::policy_result::PolicyResult;
use crate::domain::retry_state::FailureTransition;
use crate::domain::value_objects::UrlFingerprint;

#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Inserts or updates the source keyed by its base URL
    async fn upsert_by_base_url(&self, source: &Source) -> Result<Source>;
    async fn find_by_id(&self, source_id: &str) -> Result<Option<Source>>;
    /// Most recently updated first
    async fn list_recently_updated(&self, offset: u64, limit: u64) -> Result<Vec<Source>>;
    /// Recounts the entities of a source and stores the total
    async fn refresh_entity_count(&self, source_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// Returns false when (source, fingerprint) already exists
    async fn insert(&self, entity: &Entity) -> Result<bool>;
    async fn find_by_id(&self, entity_id: &str) -> Result<Option<Entity>>;
    async fn find_by_fingerprint(
        &self,
        source_id: &str,
        fingerprint: &UrlFingerprint,
    ) -> Result<Option<Entity>>;
    /// Subset of `fingerprints` already present for the source
    async fn existing_fingerprints(
        &self,
        source_id: &str,
        fingerprints: &[UrlFingerprint],
    ) -> Result<HashSet<UrlFingerprint>>;
    /// Inserts PENDING entities, silently skipping duplicates; returns rows created
    async fn insert_batch(&self, entities: &[Entity]) -> Result<usize>;

    /// Entities with `status` that are due at `now`, ordered by `next_due` ascending.
    /// PENDING entities with a null `next_due` are always due.
    async fn find_due(
        &self,
        status: ScrapingStatus,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Entity>>;
    /// Flips the given entities to QUEUED unless already in flight; returns the ids flipped
    async fn mark_queued(&self, entity_ids: &[String]) -> Result<Vec<String>>;
    /// QUEUED → FETCHING as a conditional update; None when the entity was not QUEUED
    async fn claim_for_fetch(&self, entity_id: &str) -> Result<Option<Entity>>;

    /// A PENDING entity with attempts below the limit that is due now or earlier
    async fn has_planned_scrape(
        &self,
        source_id: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    /// Puts entities stuck in QUEUED/FETCHING back to PENDING and makes
    /// SUCCESS entities with no `next_due` due now
    async fn reset_in_flight(&self) -> Result<u64>;
    /// Revives a dormant entity: PENDING, attempts 0, no due time
    async fn reset_entity(&self, entity_id: &str) -> Result<bool>;
    async fn count_by_status(&self, status: ScrapingStatus) -> Result<u64>;
}

#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    /// Newest first
    async fn recent_for_entity(&self, entity_id: &str, limit: u32) -> Result<Vec<Snapshot>>;
    async fn count_for_entity(&self, entity_id: &str) -> Result<u64>;
    /// Markdown of the newest SUCCESS snapshot that stored content
    async fn latest_successful_markdown(&self, entity_id: &str) -> Result<Option<String>>;

    /// One transaction: failure snapshot plus the entity's retry transition
    async fn record_failure(
        &self,
        entity: &Entity,
        snapshot: NewSnapshot,
        transition: &FailureTransition,
    ) -> Result<Snapshot>;
    /// One transaction: SUCCESS snapshot plus classification/content fields, attempts reset
    async fn persist_content(&self, entity: &Entity, snapshot: NewSnapshot) -> Result<Snapshot>;
    /// Separate transaction: policy result and the next due time
    async fn persist_policy(&self, entity_id: &str, result: &PolicyResult) -> Result<()>;
}

/// Repository bundle passed to the application services
#[derive(Clone)]
pub struct Repositories {
    pub sources: Arc<dyn SourceRepository>,
    pub entities: Arc<dyn EntityRepository>,
    pub snapshots: Arc<dyn SnapshotRepository>,
}
