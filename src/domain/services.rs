//! 외부 협력자 인터페이스 - collaborator contracts
//!
//! The scrape worker and policy evaluator only talk to the outside world
//! through these traits. Concrete implementations are picked at construction
//! time from configuration; tests plug in stubs.

use async_trait::async_trait;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entities::ScrapingStatus;

/// Fetch failures the retry state machine distinguishes
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Connect / network-level failure (also request timeouts)
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Fetch failed: {0}")]
    Other(String),
}

/// Raw HTTP response; any status code counts as a response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: String,
    pub headers: Vec<(String, String)>,
    pub final_url: String,
}

impl HttpResponse {
    /// Get a header value (case-insensitive name)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// HTTP 페이지 수집
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<HttpResponse, FetchError>;
}

/// HTML 정규화 (best-effort)
pub trait HtmlCleaner: Send + Sync {
    fn clean(&self, html: &str) -> String;
}

/// Classifier output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Classification {
    pub content_type: Option<String>,
    pub page_type: Option<String>,
    pub temporal: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    /// Monetary/resource cost reported by the classifier
    pub cost: f64,
}

/// 콘텐츠 분류
#[async_trait]
pub trait ContentClassifier: Send + Sync {
    async fn classify(&self, html: &str) -> Result<Classification>;
}

/// Parser output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageData {
    pub title: Option<String>,
    pub excerpt: Option<String>,
    pub thumbnail_url: Option<String>,
    pub markdown_content: String,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub canonical_url: Option<String>,
    pub canonical_number: Option<String>,
    /// Absolute URLs of linked pages as reported by the parser
    pub linked_page_urls: Vec<String>,
    pub cost: f64,
}

/// 페이지 파싱
#[async_trait]
pub trait PageParser: Send + Sync {
    /// `page_url` is used to resolve relative links
    async fn parse(&self, html: &str, page_url: &str) -> Result<PageData>;
}

/// Policy evaluation failures; these fail the whole scrape cycle
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Scorer returned malformed output: {0}")]
    Malformed(String),
    #[error("Scorer request failed: {0}")]
    Transport(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// One history row as seen by the scorer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSignal {
    pub version: u32,
    pub status: ScrapingStatus,
    pub content_length: u64,
    pub content_change_percentage: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Everything the external scorer gets to see
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringInput {
    pub url: String,
    pub title: Option<String>,
    pub entity_type: Option<String>,
    pub page_type: Option<String>,
    pub content_type: Option<String>,
    pub temporal_class: Option<String>,
    pub source_authority: f64,
    pub source_priority: f64,
    pub change_boost: f64,
    pub cost_factor: f64,
    pub error_penalty: f64,
    pub snapshot_count: u32,
    pub recent_snapshots: Vec<SnapshotSignal>,
    pub base_time: DateTime<Utc>,
}

/// Longest revisit interval a scorer may ask for (one year)
pub const MAX_NEXT_VISIT_HOURS: f64 = 8760.0;

/// Scorer output: three scores plus the revisit interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScoreResponse {
    pub value_boost: f64,
    pub priority: f64,
    pub urgency: f64,
    pub next_visit_hours: f64,
}

impl ScoreResponse {
    /// Parses and validates raw scorer output
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let response: Self = serde_json::from_str(raw.trim())
            .map_err(|e| PolicyError::Malformed(format!("not a valid score object: {e}")))?;
        response.validate()?;
        Ok(response)
    }

    /// Scores must be finite; the interval must lie in (0, [`MAX_NEXT_VISIT_HOURS`]]
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (name, value) in [
            ("value_boost", self.value_boost),
            ("priority", self.priority),
            ("urgency", self.urgency),
        ] {
            if !value.is_finite() {
                return Err(PolicyError::Malformed(format!("{name} is not a finite number")));
            }
        }
        if !self.next_visit_hours.is_finite() || self.next_visit_hours <= 0.0 {
            return Err(PolicyError::Malformed(format!(
                "next_visit_hours must be positive, got {}",
                self.next_visit_hours
            )));
        }
        if self.next_visit_hours > MAX_NEXT_VISIT_HOURS {
            return Err(PolicyError::Malformed(format!(
                "next_visit_hours must be at most {MAX_NEXT_VISIT_HOURS}, got {}",
                self.next_visit_hours
            )));
        }
        Ok(())
    }
}

/// 정책 점수 산출 (external, e.g. an LLM behind an HTTP endpoint)
#[async_trait]
pub trait PolicyScorer: Send + Sync {
    async fn score(&self, input: &ScoringInput) -> Result<ScoreResponse, PolicyError>;
}
