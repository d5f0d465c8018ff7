//! Revisit policy evaluation
//!
//! Maps an entity's recent snapshot history to a [`PolicyResult`]: five
//! bounded scores, a cost factor and the absolute next-visit time.
//!
//! - [`DefaultPolicy`]: constant neutral scores, fixed interval
//! - [`SignalDecayPolicy`]: change/cost/error signals computed locally,
//!   value/priority/urgency and the interval delegated to a [`PolicyScorer`]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::domain::entities::{Entity, Snapshot, Source};
use crate::domain::policy_result::PolicyResult;
use crate::domain::services::{PolicyError, PolicyScorer, ScoringInput, SnapshotSignal};

/// Neutral value used whenever a signal has no data
pub const NEUTRAL_SCORE: f64 = 0.5;

// Reference points for cost normalization; a value at the reference scores 1.0
const COST_REFERENCE: f64 = 0.10;
const LENGTH_REFERENCE: f64 = 50_000.0;
const MEDIA_REFERENCE: f64 = 50.0;
const DURATION_REFERENCE_MS: f64 = 10_000.0;
const STRUCTURED_REFERENCE: f64 = 20.0;

const COST_WEIGHTS: [f64; 5] = [0.3, 0.2, 0.15, 0.2, 0.15];

/// Computes the next visit for one entity
///
/// Implementations never mutate the entity; `history` is newest first.
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    fn name(&self) -> &'static str;

    /// How many recent snapshots the caller should load
    fn history_window(&self) -> u32;

    async fn evaluate(
        &self,
        entity: &Entity,
        history: &[Snapshot],
        source: Option<&Source>,
        base_time: DateTime<Utc>,
    ) -> Result<PolicyResult, PolicyError>;
}

/// Average change percentage of snapshots that have one, as a 0..1 value
pub fn change_boost(history: &[Snapshot]) -> f64 {
    let values: Vec<f64> = history
        .iter()
        .filter_map(|s| s.metrics.content_change_percentage)
        .collect();

    if values.is_empty() {
        return NEUTRAL_SCORE;
    }
    values.iter().sum::<f64>() / values.len() as f64 / 100.0
}

/// Share of error-class snapshots
pub fn error_penalty(history: &[Snapshot]) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let errors = history.iter().filter(|s| s.status.is_error_class()).count();
    errors as f64 / history.len() as f64
}

/// Weighted blend of normalized cost signals of the latest snapshot
pub fn cost_factor(latest: Option<&Snapshot>) -> f64 {
    let Some(snapshot) = latest else {
        return NEUTRAL_SCORE;
    };

    let signals = [
        snapshot.cost / COST_REFERENCE,
        snapshot.metrics.content_length as f64 / LENGTH_REFERENCE,
        f64::from(snapshot.metrics.media_count) / MEDIA_REFERENCE,
        snapshot.fetch_duration_ms as f64 / DURATION_REFERENCE_MS,
        f64::from(snapshot.metrics.structured_data_count) / STRUCTURED_REFERENCE,
    ];

    signals
        .iter()
        .zip(COST_WEIGHTS)
        .map(|(signal, weight)| signal.clamp(0.0, 1.0) * weight)
        .sum::<f64>()
        .clamp(0.0, 1.0)
}

/// `base_time + value` hours, or `Malformed` when it leaves chrono's range
fn after_hours(base_time: DateTime<Utc>, value: f64) -> Result<DateTime<Utc>, PolicyError> {
    let millis = (value * 3_600_000.0).round();
    Duration::try_milliseconds(millis as i64)
        .filter(|_| millis.is_finite() && millis.abs() < i64::MAX as f64)
        .and_then(|delta| base_time.checked_add_signed(delta))
        .ok_or_else(|| PolicyError::Malformed(format!("next visit {value}h out of range")))
}

/// Constant scores and a fixed revisit interval
#[derive(Debug, Clone)]
pub struct DefaultPolicy {
    interval: Duration,
}

impl DefaultPolicy {
    pub const NAME: &'static str = "default";

    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

#[async_trait]
impl PolicyEvaluator for DefaultPolicy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn history_window(&self) -> u32 {
        0
    }

    async fn evaluate(
        &self,
        _entity: &Entity,
        _history: &[Snapshot],
        _source: Option<&Source>,
        base_time: DateTime<Utc>,
    ) -> Result<PolicyResult, PolicyError> {
        Ok(PolicyResult::neutral(Self::NAME, base_time + self.interval, base_time))
    }
}

/// History-driven policy backed by an external scorer
pub struct SignalDecayPolicy {
    scorer: Arc<dyn PolicyScorer>,
    default_interval: Duration,
    window: u32,
}

impl SignalDecayPolicy {
    pub const NAME: &'static str = "signal_decay";

    pub fn new(scorer: Arc<dyn PolicyScorer>, default_interval: Duration, window: u32) -> Self {
        Self {
            scorer,
            default_interval,
            window: window.max(1),
        }
    }

    fn scoring_input(
        entity: &Entity,
        recent: &[Snapshot],
        source: Option<&Source>,
        base_time: DateTime<Utc>,
    ) -> ScoringInput {
        ScoringInput {
            url: entity.url().to_string(),
            title: entity.title.clone(),
            entity_type: entity.entity_type.clone(),
            page_type: entity.page_type.clone(),
            content_type: entity.content_type.clone(),
            temporal_class: entity.temporal_class.clone(),
            source_authority: source.map_or(NEUTRAL_SCORE, |s| s.authority_score),
            source_priority: source.map_or(NEUTRAL_SCORE, |s| s.priority_weight),
            change_boost: change_boost(recent),
            cost_factor: cost_factor(recent.first()),
            error_penalty: error_penalty(recent),
            snapshot_count: entity.snapshot_count,
            recent_snapshots: recent
                .iter()
                .map(|s| SnapshotSignal {
                    version: s.version,
                    status: s.status,
                    content_length: s.metrics.content_length,
                    content_change_percentage: s.metrics.content_change_percentage,
                    created_at: s.created_at,
                })
                .collect(),
            base_time,
        }
    }
}

#[async_trait]
impl PolicyEvaluator for SignalDecayPolicy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn history_window(&self) -> u32 {
        self.window
    }

    async fn evaluate(
        &self,
        entity: &Entity,
        history: &[Snapshot],
        source: Option<&Source>,
        base_time: DateTime<Utc>,
    ) -> Result<PolicyResult, PolicyError> {
        if history.is_empty() {
            return Ok(PolicyResult::neutral(
                Self::NAME,
                base_time + self.default_interval,
                base_time,
            ));
        }

        let recent = &history[..history.len().min(self.window as usize)];
        let input = Self::scoring_input(entity, recent, source, base_time);
        let response = self.scorer.score(&input).await?;
        response.validate()?;

        let next_visit_at = after_hours(base_time, response.next_visit_hours)?;
        let mut result = PolicyResult::neutral(Self::NAME, next_visit_at, base_time);
        result.set_change_boost(input.change_boost);
        result.set_cost_factor(input.cost_factor);
        result.set_error_penalty(input.error_penalty);
        result.set_value_boost(response.value_boost);
        result.set_priority(response.priority);
        result.set_urgency(response.urgency);

        debug!(
            entity_id = %entity.id,
            next_visit_hours = response.next_visit_hours,
            "Signal-decay policy evaluated"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{ContentMetrics, ScrapingStatus};
    use crate::domain::services::ScoreResponse;
    use std::sync::Mutex;

    fn snapshot(version: u32, status: ScrapingStatus, change: Option<f64>) -> Snapshot {
        Snapshot {
            id: i64::from(version),
            entity_id: "e1".into(),
            status,
            version,
            http_status: Some(200),
            metrics: ContentMetrics {
                content_change_percentage: change,
                ..ContentMetrics::default()
            },
            fetch_duration_ms: 0,
            cost: 0.0,
            error: None,
            content_hash: None,
            markdown: None,
            created_at: Utc::now(),
        }
    }

    struct FixedScorer {
        response: Result<ScoreResponse, String>,
        seen: Mutex<Vec<ScoringInput>>,
    }

    #[async_trait]
    impl PolicyScorer for FixedScorer {
        async fn score(&self, input: &ScoringInput) -> Result<ScoreResponse, PolicyError> {
            self.seen.lock().unwrap().push(input.clone());
            self.response.clone().map_err(PolicyError::Malformed)
        }
    }

    fn scorer(response: Result<ScoreResponse, String>) -> Arc<FixedScorer> {
        Arc::new(FixedScorer {
            response,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn change_boost_averages_known_percentages() {
        let history = [
            snapshot(3, ScrapingStatus::Success, Some(75.0)),
            snapshot(2, ScrapingStatus::Failed, None),
            snapshot(1, ScrapingStatus::Success, Some(50.0)),
        ];
        assert!((change_boost(&history) - 0.625).abs() < 0.01);
        assert!((change_boost(&[]) - NEUTRAL_SCORE).abs() < f64::EPSILON);
    }

    #[test]
    fn error_penalty_counts_error_classes() {
        let history = [
            snapshot(3, ScrapingStatus::Timeout, None),
            snapshot(2, ScrapingStatus::Success, None),
            snapshot(1, ScrapingStatus::Blocked, None),
        ];
        assert!((error_penalty(&history) - 0.667).abs() < 0.01);
        assert!(error_penalty(&[]).abs() < f64::EPSILON);
    }

    #[test]
    fn cost_factor_is_bounded() {
        assert!((cost_factor(None) - NEUTRAL_SCORE).abs() < f64::EPSILON);

        let mut heavy = snapshot(1, ScrapingStatus::Success, None);
        heavy.cost = 5.0;
        heavy.fetch_duration_ms = 120_000;
        heavy.metrics.content_length = 10_000_000;
        heavy.metrics.media_count = 1_000;
        heavy.metrics.structured_data_count = 100;
        assert!((cost_factor(Some(&heavy)) - 1.0).abs() < 1e-9);

        let light = snapshot(1, ScrapingStatus::Success, None);
        assert!(cost_factor(Some(&light)).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn default_policy_uses_configured_interval() {
        let policy = DefaultPolicy::new(Duration::hours(24));
        let entity = Entity::new("s1", "https://example.com/");
        let base = Utc::now();

        let result = policy.evaluate(&entity, &[], None, base).await.unwrap();
        assert_eq!(result.next_visit_at(), base + Duration::hours(24));
        assert!((result.priority() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn signal_decay_without_history_skips_scorer() {
        let fixed = scorer(Err("should not be called".into()));
        let policy = SignalDecayPolicy::new(fixed.clone(), Duration::hours(24), 5);
        let entity = Entity::new("s1", "https://example.com/");
        let base = Utc::now();

        let result = policy.evaluate(&entity, &[], None, base).await.unwrap();
        assert_eq!(result.next_visit_at(), base + Duration::hours(24));
        assert!((result.change_boost() - 0.5).abs() < f64::EPSILON);
        assert!(fixed.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn signal_decay_combines_local_signals_and_scorer_output() {
        let fixed = scorer(Ok(ScoreResponse {
            value_boost: 1.7,
            priority: 0.333,
            urgency: -2.0,
            next_visit_hours: 6.0,
        }));
        let policy = SignalDecayPolicy::new(fixed.clone(), Duration::hours(24), 2);
        let entity = Entity::new("s1", "https://example.com/");
        let source = Source::new("Example", "https://example.com/").with_weights(0.9, 0.2);
        let history = [
            snapshot(3, ScrapingStatus::Success, Some(75.0)),
            snapshot(2, ScrapingStatus::Failed, Some(50.0)),
            snapshot(1, ScrapingStatus::Failed, Some(0.0)),
        ];
        let base = Utc::now();

        let result = policy.evaluate(&entity, &history, Some(&source), base).await.unwrap();
        assert_eq!(result.next_visit_at(), base + Duration::hours(6));
        assert!((result.change_boost() - 0.63).abs() < f64::EPSILON);
        assert!((result.error_penalty() - 0.5).abs() < f64::EPSILON);
        assert!((result.value_boost() - 1.0).abs() < f64::EPSILON);
        assert!((result.priority() - 0.33).abs() < f64::EPSILON);
        assert!(result.urgency().abs() < f64::EPSILON);

        let seen = fixed.seen.lock().unwrap();
        assert_eq!(seen[0].recent_snapshots.len(), 2);
        assert!((seen[0].source_authority - 0.9).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn malformed_scorer_output_fails_loudly() {
        let policy = SignalDecayPolicy::new(scorer(Err("garbage".into())), Duration::hours(24), 5);
        let entity = Entity::new("s1", "https://example.com/");
        let history = [snapshot(1, ScrapingStatus::Success, None)];

        let result = policy.evaluate(&entity, &history, None, Utc::now()).await;
        assert!(matches!(result, Err(PolicyError::Malformed(_))));
    }

    #[tokio::test]
    async fn invalid_interval_from_scorer_is_rejected() {
        let fixed = scorer(Ok(ScoreResponse {
            value_boost: 0.5,
            priority: 0.5,
            urgency: 0.5,
            next_visit_hours: -3.0,
        }));
        let policy = SignalDecayPolicy::new(fixed, Duration::hours(24), 5);
        let entity = Entity::new("s1", "https://example.com/");
        let history = [snapshot(1, ScrapingStatus::Success, None)];

        assert!(policy.evaluate(&entity, &history, None, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn huge_interval_from_scorer_is_malformed_not_a_panic() {
        let fixed = scorer(Ok(ScoreResponse {
            value_boost: 0.5,
            priority: 0.5,
            urgency: 0.5,
            next_visit_hours: 1e12,
        }));
        let policy = SignalDecayPolicy::new(fixed, Duration::hours(24), 5);
        let entity = Entity::new("s1", "https://example.com/");
        let history = [snapshot(1, ScrapingStatus::Success, None)];

        let result = policy.evaluate(&entity, &history, None, Utc::now()).await;
        assert!(matches!(result, Err(PolicyError::Malformed(_))));
    }

    #[test]
    fn next_visit_overflow_maps_to_malformed() {
        let base = Utc::now();
        assert_eq!(after_hours(base, 6.0).unwrap(), base + Duration::hours(6));
        assert!(matches!(after_hours(base, 1e12), Err(PolicyError::Malformed(_))));
        assert!(matches!(after_hours(base, 1e30), Err(PolicyError::Malformed(_))));
    }
}
