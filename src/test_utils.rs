//! Test utilities for the scrape pipeline
//!
//! Stub collaborators and a throwaway SQLite database so integration tests
//! can drive the worker, scheduler and sweep without network access.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::application::link_discovery::LinkDiscovery;
use crate::application::policy::{DefaultPolicy, PolicyEvaluator};
use crate::application::scrape_worker::{Collaborators, ScrapeWorker};
use crate::domain::entities::{Entity, Source};
use crate::domain::events::EventBus;
use crate::domain::repositories::Repositories;
use crate::domain::retry_state::RetryPolicy;
use crate::domain::services::{
    Classification, ContentClassifier, FetchError, Fetcher, HttpResponse, PageData, PageParser,
    PolicyError, PolicyScorer, ScoreResponse, ScoringInput,
};
use crate::infrastructure::{
    DatabaseConnection, MetaTagClassifier, RegexHtmlCleaner, ScraperPageParser, sqlite_repositories,
};

/// Database file in the system temp dir, removed on drop
pub struct TestDatabase {
    pub connection: DatabaseConnection,
    path: PathBuf,
}

impl TestDatabase {
    /// Fresh, migrated database per call
    pub async fn new() -> Result<Self> {
        let path = std::env::temp_dir().join(format!("pulse-test-{}.db", uuid::Uuid::new_v4()));
        let connection = DatabaseConnection::open(&format!("sqlite:{}", path.display())).await?;
        connection.migrate().await?;
        Ok(Self { connection, path })
    }

    pub fn pool(&self) -> sqlx::SqlitePool {
        self.connection.pool().clone()
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}

/// Fetcher answering from a URL → response table
#[derive(Default)]
pub struct StubFetcher {
    responses: Mutex<HashMap<String, Result<HttpResponse, FetchError>>>,
    calls: AtomicUsize,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn respond(self, url: &str, status_code: u16, body: &str) -> Self {
        self.set(url, Ok(html_response(url, status_code, body)));
        self
    }

    #[must_use]
    pub fn fail(self, url: &str, error: FetchError) -> Self {
        self.set(url, Err(error));
        self
    }

    pub fn set(&self, url: &str, outcome: Result<HttpResponse, FetchError>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(url.to_string(), outcome);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<HttpResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .map_err(|_| FetchError::Other("stub poisoned".into()))?
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::Other(format!("no stub for {url}"))))
    }
}

pub fn html_response(url: &str, status_code: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status_code,
        body: body.to_string(),
        headers: vec![("content-type".into(), "text/html".into())],
        final_url: url.to_string(),
    }
}

/// Parser that always fails
pub struct FailingParser;

#[async_trait]
impl PageParser for FailingParser {
    async fn parse(&self, _html: &str, _page_url: &str) -> Result<PageData> {
        Err(anyhow!("parser exploded"))
    }
}

/// Classifier that always fails
pub struct FailingClassifier;

#[async_trait]
impl ContentClassifier for FailingClassifier {
    async fn classify(&self, _html: &str) -> Result<Classification> {
        Err(anyhow!("classifier unavailable"))
    }
}

/// Scorer returning a fixed response (or error) and counting calls
pub struct StubScorer {
    response: Result<ScoreResponse, String>,
    calls: AtomicUsize,
}

impl StubScorer {
    pub fn returning(response: ScoreResponse) -> Self {
        Self {
            response: Ok(response),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn malformed(message: &str) -> Self {
        Self {
            response: Err(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyScorer for StubScorer {
    async fn score(&self, _input: &ScoringInput) -> Result<ScoreResponse, PolicyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.response {
            Ok(response) => {
                response.validate()?;
                Ok(response.clone())
            }
            Err(message) => Err(PolicyError::Malformed(message.clone())),
        }
    }
}

/// Built-in HTML collaborators around the given fetcher
pub fn collaborators(fetcher: Arc<dyn Fetcher>) -> Collaborators {
    Collaborators {
        fetcher,
        cleaner: Arc::new(RegexHtmlCleaner),
        classifier: Arc::new(MetaTagClassifier),
        parser: Arc::new(ScraperPageParser),
    }
}

/// Database, repositories and one source at `https://example.com/`
pub struct TestContext {
    pub database: TestDatabase,
    pub events: EventBus,
    pub repos: Repositories,
    pub source: Source,
}

impl TestContext {
    pub async fn new() -> Result<Self> {
        let database = TestDatabase::new().await?;
        let events = EventBus::default();
        let repos = sqlite_repositories(database.pool(), events.clone());
        let source = repos
            .sources
            .upsert_by_base_url(&Source::new("Example", "https://example.com/"))
            .await?;

        Ok(Self {
            database,
            events,
            repos,
            source,
        })
    }

    /// Inserts an entity of the test source and returns it as stored
    pub async fn insert_entity(&self, url: &str) -> Result<Entity> {
        let entity = Entity::new(self.source.id.clone(), url);
        self.repos.entities.insert(&entity).await?;
        self.reload(&entity.id).await
    }

    /// Inserts an entity and flips it to QUEUED
    pub async fn queued_entity(&self, url: &str) -> Result<Entity> {
        let entity = self.insert_entity(url).await?;
        self.repos.entities.mark_queued(&[entity.id.clone()]).await?;
        self.reload(&entity.id).await
    }

    pub async fn reload(&self, entity_id: &str) -> Result<Entity> {
        self.repos
            .entities
            .find_by_id(entity_id)
            .await?
            .ok_or_else(|| anyhow!("entity {entity_id} not found"))
    }

    /// Worker with discovery enabled and a 24h default policy
    pub fn worker(&self, collaborators: Collaborators, max_attempts: u32) -> ScrapeWorker {
        let policy: Arc<dyn PolicyEvaluator> =
            Arc::new(DefaultPolicy::new(chrono::Duration::hours(24)));
        self.worker_with_policy(collaborators, policy, max_attempts)
    }

    pub fn worker_with_policy(
        &self,
        collaborators: Collaborators,
        policy: Arc<dyn PolicyEvaluator>,
        max_attempts: u32,
    ) -> ScrapeWorker {
        ScrapeWorker::new(
            self.repos.clone(),
            collaborators,
            policy,
            RetryPolicy::new(max_attempts),
        )
        .with_discovery(LinkDiscovery::new(Arc::clone(&self.repos.entities), 500))
    }
}
