//! Domain entities
//!
//! Contains the core scrape-tracking entities: sources, entities and their
//! immutable snapshot history.

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::policy_result::PolicyResult;
use crate::domain::value_objects::UrlFingerprint;

/// Scraping status of an entity
///
/// Declaration order is also the order the scheduler scans statuses in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapingStatus {
    Pending,
    Queued,
    Fetching,
    Success,
    Failed,
    Timeout,
    Blocked,
}

impl ScrapingStatus {
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Queued,
        Self::Fetching,
        Self::Success,
        Self::Failed,
        Self::Timeout,
        Self::Blocked,
    ];

    /// Statuses the scheduler may pick up, in scan order (PENDING first)
    pub const SCHEDULABLE: [Self; 5] = [
        Self::Pending,
        Self::Success,
        Self::Failed,
        Self::Timeout,
        Self::Blocked,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Fetching => "fetching",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Blocked => "blocked",
        }
    }

    /// FAILED, TIMEOUT and BLOCKED count against the error penalty
    #[must_use]
    pub const fn is_error_class(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout | Self::Blocked)
    }

    /// Claimed by the queue or a worker
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Queued | Self::Fetching)
    }
}

impl std::fmt::Display for ScrapingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScrapingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown scraping status: {s}"))
    }
}

/// A seed origin that entities belong to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub base_url: String,
    /// Read-only input to the policy evaluator (0.0 - 1.0)
    pub authority_score: f64,
    /// Business priority weight, also read-only for the policy evaluator
    pub priority_weight: f64,
    /// Maintained by the entity count aggregator
    pub entity_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            base_url: base_url.into(),
            authority_score: 0.5,
            priority_weight: 0.5,
            entity_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn with_weights(mut self, authority_score: f64, priority_weight: f64) -> Self {
        self.authority_score = authority_score;
        self.priority_weight = priority_weight;
        self
    }
}

/// A trackable scrape target (page, image, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub source_id: String,
    url: String,
    url_fingerprint: UrlFingerprint,

    // Classification, filled in by the first successful fetch
    pub entity_type: Option<String>,
    pub page_type: Option<String>,
    pub content_type: Option<String>,
    pub temporal_class: Option<String>,

    pub title: Option<String>,
    pub description: Option<String>,
    pub thumbnail_url: Option<String>,
    pub canonical_url: Option<String>,
    /// Trailing numeric id of the canonical URL path, when it has one
    pub canonical_number: Option<String>,
    pub tags: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub content_updated_at: Option<DateTime<Utc>>,

    pub status: ScrapingStatus,
    pub attempts: u32,
    /// Null when never scheduled or when retries are exhausted
    pub next_due: Option<DateTime<Utc>>,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub snapshot_count: u32,
    pub policy_result: Option<PolicyResult>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Creates a new PENDING entity that has never been scheduled
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            url_fingerprint: UrlFingerprint::of(&url),
            url,
            entity_type: None,
            page_type: None,
            content_type: None,
            temporal_class: None,
            title: None,
            description: None,
            thumbnail_url: None,
            canonical_url: None,
            canonical_number: None,
            tags: Vec::new(),
            published_at: None,
            content_updated_at: None,
            status: ScrapingStatus::Pending,
            attempts: 0,
            next_due: None,
            last_fetched_at: None,
            snapshot_count: 0,
            policy_result: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub const fn url_fingerprint(&self) -> &UrlFingerprint {
        &self.url_fingerprint
    }

    /// Changes the URL and recomputes the fingerprint
    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
        self.url_fingerprint = UrlFingerprint::of(&self.url);
    }

    /// Host of the entity URL, lowercased
    #[must_use]
    pub fn host(&self) -> Option<String> {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
    }

    /// Retries exhausted: no due time left and attempts at or above the limit
    #[must_use]
    pub fn is_dormant(&self, max_attempts: u32) -> bool {
        self.next_due.is_none() && self.attempts >= max_attempts && self.status.is_error_class()
    }

    /// Rebuilds an entity from persisted columns, trusting the stored fingerprint
    pub(crate) fn restore(
        id: String,
        source_id: String,
        url: String,
        url_fingerprint: UrlFingerprint,
    ) -> Self {
        let mut entity = Self::new(source_id, url);
        entity.id = id;
        entity.url_fingerprint = url_fingerprint;
        entity
    }
}

/// One immutable fetch-attempt record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: i64,
    pub entity_id: String,
    pub status: ScrapingStatus,
    /// Per entity, previous max + 1
    pub version: u32,
    pub http_status: Option<u16>,
    pub metrics: ContentMetrics,
    pub fetch_duration_ms: u64,
    pub cost: f64,
    pub error: Option<String>,
    pub content_hash: Option<String>,
    pub markdown: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Content metrics recorded per snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMetrics {
    pub content_length: u64,
    pub link_count: u32,
    pub media_count: u32,
    pub structured_data_count: u32,
    pub content_change_percentage: Option<f64>,
}

/// Snapshot data before the store assigns id, version and timestamp
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub entity_id: String,
    pub status: ScrapingStatus,
    pub http_status: Option<u16>,
    pub metrics: ContentMetrics,
    pub fetch_duration_ms: u64,
    pub cost: f64,
    pub error: Option<String>,
    pub content_hash: Option<String>,
    pub markdown: Option<String>,
}

impl NewSnapshot {
    /// Snapshot for a failed attempt; no content metrics
    pub fn failure(
        entity_id: impl Into<String>,
        status: ScrapingStatus,
        http_status: Option<u16>,
        fetch_duration_ms: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            status,
            http_status,
            metrics: ContentMetrics::default(),
            fetch_duration_ms,
            cost: 0.0,
            error: Some(error.into()),
            content_hash: None,
            markdown: None,
        }
    }
}
