//! End-to-end worker cycles against a real SQLite file and stub collaborators

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tokio_test::assert_ok;

use pulse_scraper_lib::application::policy::{DefaultPolicy, PolicyEvaluator, SignalDecayPolicy};
use pulse_scraper_lib::application::scrape_worker::ScrapeOutcome;
use pulse_scraper_lib::domain::entities::{Entity, ScrapingStatus, Snapshot, Source};
use pulse_scraper_lib::domain::policy_result::PolicyResult;
use pulse_scraper_lib::domain::repositories::EntityRepository;
use pulse_scraper_lib::domain::services::{FetchError, PolicyError, ScoreResponse};
use pulse_scraper_lib::domain::value_objects::NormalizedUrl;
use pulse_scraper_lib::test_utils::{
    FailingClassifier, FailingParser, StubFetcher, StubScorer, TestContext, collaborators,
    html_response,
};

const PAGE_URL: &str = "https://example.com/articles/1";

const PAGE: &str = r#"<!doctype html>
<html>
<head>
  <title>Spring release notes</title>
  <meta name="description" content="Everything that shipped this spring.">
  <meta property="og:type" content="article">
  <link rel="canonical" href="/articles/1">
  <script type="application/ld+json">{"@type":"Article"}</script>
</head>
<body>
  <h1>Spring release notes</h1>
  <p>Read the <a href="/articles/2">follow-up</a> or the <a href="https://example.com/about#team">team page</a>.</p>
  <p>Elsewhere: <a href="https://other.com/y">other site</a>.</p>
  <img src="/cover.png" alt="cover">
</body>
</html>"#;

fn assert_close(actual: chrono::DateTime<Utc>, expected: chrono::DateTime<Utc>) {
    let drift = (actual - expected).num_seconds().abs();
    assert!(drift <= 60, "expected {expected}, got {actual} ({drift}s off)");
}

#[tokio::test]
async fn not_found_records_failed_snapshot_and_backs_off_one_hour() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 404, "gone"));
    let worker = ctx.worker(collaborators(fetcher), 5);

    let outcome = assert_ok!(worker.run(&entity.id).await);
    assert_eq!(
        outcome,
        ScrapeOutcome::Failed {
            status: ScrapingStatus::Failed,
            attempts: 1,
            exhausted: false
        }
    );

    let snapshots = ctx.repos.snapshots.recent_for_entity(&entity.id, 10).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].status, ScrapingStatus::Failed);
    assert_eq!(snapshots[0].version, 1);
    assert_eq!(snapshots[0].http_status, Some(404));

    let stored = ctx.reload(&entity.id).await.unwrap();
    assert_eq!(stored.status, ScrapingStatus::Failed);
    assert_eq!(stored.attempts, 1);
    assert_close(stored.next_due.unwrap(), Utc::now() + Duration::seconds(3_600));
}

#[tokio::test]
async fn forbidden_is_blocked_not_failed() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 403, "no"));
    let worker = ctx.worker(collaborators(fetcher), 5);

    worker.run(&entity.id).await.unwrap();

    let snapshots = ctx.repos.snapshots.recent_for_entity(&entity.id, 10).await.unwrap();
    assert_eq!(snapshots[0].status, ScrapingStatus::Blocked);
    assert_eq!(ctx.reload(&entity.id).await.unwrap().status, ScrapingStatus::Blocked);
}

#[tokio::test]
async fn connect_failure_is_a_timeout() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(
        StubFetcher::new().fail(PAGE_URL, FetchError::Connect("connection refused".into())),
    );
    let worker = ctx.worker(collaborators(fetcher), 5);

    worker.run(&entity.id).await.unwrap();

    let stored = ctx.reload(&entity.id).await.unwrap();
    assert_eq!(stored.status, ScrapingStatus::Timeout);
    assert_eq!(stored.attempts, 1);
    let snapshots = ctx.repos.snapshots.recent_for_entity(&entity.id, 10).await.unwrap();
    assert!(snapshots[0].http_status.is_none());
    assert!(snapshots[0].error.as_deref().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn last_allowed_failure_makes_the_entity_dormant() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 500, "boom"));
    let worker = ctx.worker(collaborators(fetcher), 2);

    worker.run(&entity.id).await.unwrap();
    ctx.repos.entities.mark_queued(&[entity.id.clone()]).await.unwrap();
    let outcome = worker.run(&entity.id).await.unwrap();

    assert_eq!(
        outcome,
        ScrapeOutcome::Failed {
            status: ScrapingStatus::Failed,
            attempts: 2,
            exhausted: true
        }
    );
    let stored = ctx.reload(&entity.id).await.unwrap();
    assert_eq!(stored.attempts, 2);
    assert!(stored.next_due.is_none());
    assert!(stored.is_dormant(2));

    let far_future = Utc::now() + Duration::days(365);
    for status in ScrapingStatus::SCHEDULABLE {
        let due = ctx.repos.entities.find_due(status, far_future, 10).await.unwrap();
        assert!(due.iter().all(|e| e.id != entity.id), "dormant entity selected as {status}");
    }
}

#[tokio::test]
async fn worker_is_a_no_op_unless_queued() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.insert_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 200, PAGE));
    let worker = ctx.worker(collaborators(fetcher.clone()), 5);

    let outcome = worker.run(&entity.id).await.unwrap();

    assert_eq!(outcome, ScrapeOutcome::Skipped);
    assert_eq!(fetcher.calls(), 0);
    assert_eq!(ctx.repos.snapshots.count_for_entity(&entity.id).await.unwrap(), 0);
    assert_eq!(ctx.reload(&entity.id).await.unwrap().status, ScrapingStatus::Pending);
}

#[tokio::test]
async fn success_resets_attempts_and_bumps_version_by_one() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 404, "gone"));
    let worker = ctx.worker(collaborators(fetcher.clone()), 5);

    worker.run(&entity.id).await.unwrap();
    assert_eq!(ctx.reload(&entity.id).await.unwrap().attempts, 1);

    fetcher.set(PAGE_URL, Ok(html_response(PAGE_URL, 200, PAGE)));
    ctx.repos.entities.mark_queued(&[entity.id.clone()]).await.unwrap();
    let outcome = worker.run(&entity.id).await.unwrap();
    assert_eq!(outcome, ScrapeOutcome::Succeeded { version: 2 });

    let stored = ctx.reload(&entity.id).await.unwrap();
    assert_eq!(stored.status, ScrapingStatus::Success);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.snapshot_count, 2);
    assert_eq!(stored.title.as_deref(), Some("Spring release notes"));
    assert_eq!(stored.description.as_deref(), Some("Everything that shipped this spring."));
    assert_eq!(stored.page_type.as_deref(), Some("article"));
    assert_eq!(stored.entity_type.as_deref(), Some("page"));
    assert_eq!(stored.canonical_url.as_deref(), Some(PAGE_URL));
    assert_eq!(stored.canonical_number.as_deref(), Some("1"));
    assert_close(stored.next_due.unwrap(), Utc::now() + Duration::hours(24));
    assert_eq!(stored.policy_result.unwrap().policy(), "default");

    let latest = &ctx.repos.snapshots.recent_for_entity(&entity.id, 1).await.unwrap()[0];
    assert_eq!(latest.status, ScrapingStatus::Success);
    assert_eq!(latest.http_status, Some(200));
    assert_eq!(latest.metrics.structured_data_count, 1);
    assert_eq!(latest.metrics.media_count, 1);
    assert!(latest.metrics.link_count >= 3);
    assert!(latest.markdown.as_deref().unwrap().contains("# Spring release notes"));
    assert!(latest.content_hash.is_some());
}

#[tokio::test]
async fn second_success_reports_content_change() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 200, PAGE));
    let worker = ctx.worker(collaborators(fetcher.clone()), 5);

    worker.run(&entity.id).await.unwrap();
    let first = &ctx.repos.snapshots.recent_for_entity(&entity.id, 1).await.unwrap()[0];
    assert!(first.metrics.content_change_percentage.is_none());

    ctx.repos.entities.mark_queued(&[entity.id.clone()]).await.unwrap();
    worker.run(&entity.id).await.unwrap();
    let second = &ctx.repos.snapshots.recent_for_entity(&entity.id, 1).await.unwrap()[0];
    assert_eq!(second.version, 2);
    assert_eq!(second.metrics.content_change_percentage, Some(0.0));
}

#[tokio::test]
async fn discovery_creates_same_host_links_once() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 200, PAGE));
    let worker = ctx.worker(collaborators(fetcher), 5);

    worker.run(&entity.id).await.unwrap();
    assert_eq!(ctx.repos.entities.count_by_status(ScrapingStatus::Pending).await.unwrap(), 2);

    for url in ["https://example.com/articles/2", "https://example.com/about"] {
        let fingerprint = NormalizedUrl::parse(url).unwrap().fingerprint();
        let found = ctx
            .repos
            .entities
            .find_by_fingerprint(&ctx.source.id, &fingerprint)
            .await
            .unwrap();
        assert!(found.is_some(), "{url} was not discovered");
    }
    let foreign = NormalizedUrl::parse("https://other.com/y").unwrap().fingerprint();
    assert!(
        ctx.repos
            .entities
            .find_by_fingerprint(&ctx.source.id, &foreign)
            .await
            .unwrap()
            .is_none()
    );

    ctx.repos.entities.mark_queued(&[entity.id.clone()]).await.unwrap();
    worker.run(&entity.id).await.unwrap();
    assert_eq!(ctx.repos.entities.count_by_status(ScrapingStatus::Pending).await.unwrap(), 2);
}

#[tokio::test]
async fn parser_failure_after_good_fetch_consumes_an_attempt() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 200, PAGE));
    let mut collab = collaborators(fetcher);
    collab.parser = Arc::new(FailingParser);
    let worker = ctx.worker(collab, 5);

    let outcome = worker.run(&entity.id).await.unwrap();
    assert!(matches!(outcome, ScrapeOutcome::Failed { status: ScrapingStatus::Failed, attempts: 1, .. }));

    let snapshots = ctx.repos.snapshots.recent_for_entity(&entity.id, 10).await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].http_status, Some(200));
    assert!(snapshots[0].error.as_deref().unwrap().contains("parser exploded"));
    assert!(ctx.reload(&entity.id).await.unwrap().next_due.is_some());
}

#[tokio::test]
async fn classifier_failure_takes_the_same_path() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 200, PAGE));
    let mut collab = collaborators(fetcher);
    collab.classifier = Arc::new(FailingClassifier);
    let worker = ctx.worker(collab, 5);

    worker.run(&entity.id).await.unwrap();

    let stored = ctx.reload(&entity.id).await.unwrap();
    assert_eq!(stored.status, ScrapingStatus::Failed);
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn malformed_scorer_output_fails_the_cycle() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 200, PAGE));
    let scorer = Arc::new(StubScorer::malformed("not json"));
    let policy: Arc<dyn PolicyEvaluator> =
        Arc::new(SignalDecayPolicy::new(scorer.clone(), Duration::hours(24), 5));
    let worker = ctx.worker_with_policy(collaborators(fetcher), policy, 5);

    let outcome = worker.run(&entity.id).await.unwrap();

    assert_eq!(scorer.calls(), 1);
    assert!(matches!(outcome, ScrapeOutcome::Failed { attempts: 1, .. }));
    // content was committed before the policy step failed
    let snapshots = ctx.repos.snapshots.recent_for_entity(&entity.id, 10).await.unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].status, ScrapingStatus::Failed);
    assert_eq!(snapshots[0].version, 2);
    assert_eq!(snapshots[1].status, ScrapingStatus::Success);
}

#[tokio::test]
async fn out_of_range_interval_from_scorer_fails_the_cycle() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 200, PAGE));
    let scorer = Arc::new(StubScorer::returning(ScoreResponse {
        value_boost: 0.5,
        priority: 0.5,
        urgency: 0.5,
        next_visit_hours: 1e12,
    }));
    let policy: Arc<dyn PolicyEvaluator> =
        Arc::new(SignalDecayPolicy::new(scorer, Duration::hours(24), 5));
    let worker = ctx.worker_with_policy(collaborators(fetcher), policy, 5);

    let outcome = assert_ok!(worker.run(&entity.id).await);

    assert!(matches!(outcome, ScrapeOutcome::Failed { attempts: 1, .. }));
    let stored = ctx.reload(&entity.id).await.unwrap();
    assert_eq!(stored.status, ScrapingStatus::Failed);
    assert_close(stored.next_due.unwrap(), Utc::now() + Duration::hours(1));
}

/// Checks which statuses would select the entity while policy runs
struct SelectionSpy {
    entities: Arc<dyn EntityRepository>,
    inner: DefaultPolicy,
    selectable_as: Mutex<Vec<ScrapingStatus>>,
}

#[async_trait]
impl PolicyEvaluator for SelectionSpy {
    fn name(&self) -> &'static str {
        "selection-spy"
    }

    fn history_window(&self) -> u32 {
        0
    }

    async fn evaluate(
        &self,
        entity: &Entity,
        history: &[Snapshot],
        source: Option<&Source>,
        base_time: DateTime<Utc>,
    ) -> Result<PolicyResult, PolicyError> {
        for status in ScrapingStatus::SCHEDULABLE {
            let due = self.entities.find_due(status, Utc::now(), 100).await.unwrap();
            if due.iter().any(|e| e.id == entity.id) {
                self.selectable_as.lock().unwrap().push(status);
            }
        }
        self.inner.evaluate(entity, history, source, base_time).await
    }
}

#[tokio::test]
async fn retried_entity_is_not_selectable_while_policy_runs() {
    let ctx = TestContext::new().await.unwrap();
    let mut entity = Entity::new(ctx.source.id.clone(), PAGE_URL);
    entity.status = ScrapingStatus::Failed;
    entity.attempts = 1;
    entity.next_due = Some(Utc::now() - Duration::minutes(5));
    ctx.repos.entities.insert(&entity).await.unwrap();
    ctx.repos.entities.mark_queued(&[entity.id.clone()]).await.unwrap();

    let spy = Arc::new(SelectionSpy {
        entities: Arc::clone(&ctx.repos.entities),
        inner: DefaultPolicy::new(Duration::hours(24)),
        selectable_as: Mutex::new(Vec::new()),
    });
    let fetcher = Arc::new(StubFetcher::new().respond(PAGE_URL, 200, PAGE));
    let worker = ctx.worker_with_policy(collaborators(fetcher), spy.clone(), 5);

    let outcome = worker.run(&entity.id).await.unwrap();

    assert_eq!(outcome, ScrapeOutcome::Succeeded { version: 1 });
    assert!(spy.selectable_as.lock().unwrap().is_empty());
    let stored = ctx.reload(&entity.id).await.unwrap();
    assert_close(stored.next_due.unwrap(), Utc::now() + Duration::hours(24));
}

#[tokio::test]
async fn abandoned_cycle_counts_as_a_failed_attempt() {
    let ctx = TestContext::new().await.unwrap();
    let entity = ctx.queued_entity(PAGE_URL).await.unwrap();
    let idle = ctx.insert_entity("https://example.com/idle").await.unwrap();
    let fetcher = Arc::new(StubFetcher::new());
    let worker = ctx.worker(collaborators(fetcher), 5);

    // claimed, then the cycle died before writing anything
    ctx.repos.entities.claim_for_fetch(&entity.id).await.unwrap().unwrap();
    let outcome = worker.abandon(&entity.id).await.unwrap();

    assert!(matches!(
        outcome,
        Some(ScrapeOutcome::Failed { status: ScrapingStatus::Failed, attempts: 1, .. })
    ));
    let stored = ctx.reload(&entity.id).await.unwrap();
    assert_eq!(stored.status, ScrapingStatus::Failed);
    assert!(stored.next_due.is_some());

    assert_eq!(worker.abandon(&idle.id).await.unwrap(), None);
    assert_eq!(ctx.reload(&idle.id).await.unwrap().status, ScrapingStatus::Pending);
}
