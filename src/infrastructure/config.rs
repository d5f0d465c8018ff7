//! Configuration infrastructure
//!
//! Contains configuration loading and validation for the scrape pipeline.
//!
//! Sources are layered in this order (later wins):
//! 1. Compiled defaults (see [`defaults`])
//! 2. Optional config file (TOML/JSON/YAML, picked by extension)
//! 3. Environment variables, `PULSE__SCHEDULER__DISPATCH_LIMIT=20` style

#![allow(clippy::uninlined_format_args)]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub sweep: SweepConfig,
    pub retry: RetryConfig,
    pub policy: PolicyConfig,
    pub fetch: FetchConfig,
    pub discovery: DiscoveryConfig,
    /// Sources upserted by base URL at startup
    pub seed_sources: Vec<SeedSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite URL, e.g. `sqlite:/var/lib/pulse/pulse.db`
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    pub level: String,

    /// Enable JSON formatted logs (file output only)
    pub json_format: bool,

    pub console_output: bool,
    pub file_output: bool,

    /// Log directory; defaults to the local data dir
    pub directory: Option<PathBuf>,

    /// Number of log files to keep (older files will be deleted)
    pub max_files: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Parallel queue workers
    pub workers: usize,
    /// Max scrape jobs queued or running at once
    pub max_scrape_depth: usize,
    /// How long an idle worker waits before re-checking the queue
    pub idle_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Max entities dispatched per pass
    pub dispatch_limit: u32,
    /// Execution lock safety TTL
    pub lock_ttl_secs: u64,
    /// Delay before the loop re-dispatches itself
    pub reschedule_delay_ms: u64,
    /// External safety-net tick
    pub tick_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub interval_secs: u64,
    pub chunk_size: u32,
    /// Wall-clock budget, checked between chunks
    pub time_budget_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Constant scores, fixed interval
    Default,
    /// Local history signals plus an external scorer
    SignalDecay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub kind: PolicyKind,
    pub default_interval_hours: f64,
    /// Snapshots considered by the signal-decay policy
    pub history_window: u32,
    /// Endpoint of the external scorer (signal_decay only)
    pub scorer_url: Option<String>,
    pub scorer_api_key: Option<String>,
    pub scorer_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_requests_per_second: u32,
    pub max_redirects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Upper bound of new entities created from one page
    pub max_links_per_page: usize,
    pub description_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedSource {
    pub name: String,
    pub base_url: String,
    #[serde(default = "defaults::neutral_weight")]
    pub authority_score: f64,
    #[serde(default = "defaults::neutral_weight")]
    pub priority_weight: f64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: defaults::database_url(),
            max_connections: defaults::DB_MAX_CONNECTIONS,
            busy_timeout_ms: defaults::DB_BUSY_TIMEOUT_MS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            json_format: defaults::LOG_JSON_FORMAT,
            console_output: defaults::LOG_CONSOLE_OUTPUT,
            file_output: defaults::LOG_FILE_OUTPUT,
            directory: None,
            max_files: defaults::LOG_MAX_FILES,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: defaults::QUEUE_WORKERS,
            max_scrape_depth: defaults::MAX_SCRAPE_QUEUE_DEPTH,
            idle_poll_ms: defaults::QUEUE_IDLE_POLL_MS,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dispatch_limit: defaults::SCHEDULER_DISPATCH_LIMIT,
            lock_ttl_secs: defaults::SCHEDULER_LOCK_TTL_SECS,
            reschedule_delay_ms: defaults::SCHEDULER_RESCHEDULE_DELAY_MS,
            tick_interval_secs: defaults::SCHEDULER_TICK_INTERVAL_SECS,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::SWEEP_INTERVAL_SECS,
            chunk_size: defaults::SWEEP_CHUNK_SIZE,
            time_budget_secs: defaults::SWEEP_TIME_BUDGET_SECS,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::MAX_ATTEMPTS,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            kind: PolicyKind::Default,
            default_interval_hours: defaults::DEFAULT_INTERVAL_HOURS,
            history_window: defaults::POLICY_HISTORY_WINDOW,
            scorer_url: None,
            scorer_api_key: None,
            scorer_timeout_secs: defaults::SCORER_TIMEOUT_SECS,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::USER_AGENT.to_string(),
            timeout_secs: defaults::REQUEST_TIMEOUT_SECONDS,
            connect_timeout_secs: defaults::CONNECT_TIMEOUT_SECONDS,
            max_requests_per_second: defaults::MAX_REQUESTS_PER_SECOND,
            max_redirects: defaults::MAX_REDIRECTS,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_links_per_page: defaults::MAX_LINKS_PER_PAGE,
            description_limit: defaults::DESCRIPTION_LIMIT,
        }
    }
}

impl AppConfig {
    /// Loads defaults, then the optional file, then `PULSE__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("PULSE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;

        info!(
            "✅ Configuration loaded (file: {})",
            path.unwrap_or("<defaults>")
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: &str| {
            Err(ConfigError::Validation {
                message: message.to_string(),
            })
        };

        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1");
        }
        if self.queue.workers == 0 {
            return fail("queue.workers must be greater than 0");
        }
        if self.queue.max_scrape_depth == 0 {
            return fail("queue.max_scrape_depth must be greater than 0");
        }
        if self.scheduler.lock_ttl_secs == 0 {
            return fail("scheduler.lock_ttl_secs must be greater than 0");
        }
        if self.scheduler.tick_interval_secs == 0 || self.sweep.interval_secs == 0 {
            return fail("tick and sweep intervals must be greater than 0");
        }
        if self.sweep.chunk_size == 0 {
            return fail("sweep.chunk_size must be greater than 0");
        }
        if !(self.policy.default_interval_hours > 0.0) {
            return fail("policy.default_interval_hours must be positive");
        }
        if self.policy.kind == PolicyKind::SignalDecay && self.policy.scorer_url.is_none() {
            return fail("policy.scorer_url is required for the signal_decay policy");
        }
        if self.fetch.max_requests_per_second == 0 {
            return fail("fetch.max_requests_per_second must be greater than 0");
        }
        Ok(())
    }
}

impl QueueConfig {
    pub const fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl SchedulerConfig {
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub const fn reschedule_delay(&self) -> Duration {
        Duration::from_millis(self.reschedule_delay_ms)
    }

    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

impl SweepConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub const fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }
}

impl PolicyConfig {
    pub fn default_interval(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.default_interval_hours * 3_600_000.0) as i64)
    }
}

/// Application data directory (`~/.local/share/pulse-scraper` on Linux)
pub fn get_app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default())
        .join(defaults::APP_DIR_NAME)
}

/// Default configuration values
pub mod defaults {
    pub const APP_DIR_NAME: &str = "pulse-scraper";

    pub const DB_MAX_CONNECTIONS: u32 = 10;
    pub const DB_BUSY_TIMEOUT_MS: u64 = 5_000;

    pub const QUEUE_WORKERS: usize = 8;
    pub const MAX_SCRAPE_QUEUE_DEPTH: usize = 100;
    pub const QUEUE_IDLE_POLL_MS: u64 = 250;

    pub const SCHEDULER_DISPATCH_LIMIT: u32 = 50;
    pub const SCHEDULER_LOCK_TTL_SECS: u64 = 300;
    pub const SCHEDULER_RESCHEDULE_DELAY_MS: u64 = 1_000;
    pub const SCHEDULER_TICK_INTERVAL_SECS: u64 = 60;

    pub const SWEEP_INTERVAL_SECS: u64 = 300;
    pub const SWEEP_CHUNK_SIZE: u32 = 100;
    pub const SWEEP_TIME_BUDGET_SECS: u64 = 50;

    pub const MAX_ATTEMPTS: u32 = 5;

    pub const DEFAULT_INTERVAL_HOURS: f64 = 24.0;
    pub const POLICY_HISTORY_WINDOW: u32 = 5;
    pub const SCORER_TIMEOUT_SECS: u64 = 60;

    pub const USER_AGENT: &str = "pulse-scraper/0.1 (+revisit scheduler)";
    pub const REQUEST_TIMEOUT_SECONDS: u64 = 30;
    pub const CONNECT_TIMEOUT_SECONDS: u64 = 10;
    pub const MAX_REQUESTS_PER_SECOND: u32 = 10;
    pub const MAX_REDIRECTS: usize = 10;

    pub const MAX_LINKS_PER_PAGE: usize = 500;
    pub const DESCRIPTION_LIMIT: usize = 1024;

    pub const LOG_LEVEL: &str = "info";
    pub const LOG_JSON_FORMAT: bool = false;
    pub const LOG_CONSOLE_OUTPUT: bool = true;
    pub const LOG_FILE_OUTPUT: bool = true;
    pub const LOG_MAX_FILES: u32 = 5;

    pub const fn neutral_weight() -> f64 {
        0.5
    }

    pub fn database_url() -> String {
        let path = super::get_app_data_dir().join("database").join("pulse.db");
        format!("sqlite:{}", path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.discovery.description_limit, 1024);
        assert_eq!(config.policy.default_interval(), chrono::Duration::hours(24));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[scheduler]
dispatch_limit = 7

[retry]
max_attempts = 2

[[seed_sources]]
name = "Example"
base_url = "https://example.com/"
authority_score = 0.9
"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.dispatch_limit, 7);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.scheduler.lock_ttl_secs, 300);
        assert_eq!(config.seed_sources.len(), 1);
        assert!((config.seed_sources[0].priority_weight - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn signal_decay_requires_scorer_url() {
        let mut config = AppConfig::default();
        config.policy.kind = PolicyKind::SignalDecay;
        assert!(matches!(config.validate(), Err(ConfigError::Validation { .. })));
        config.policy.scorer_url = Some("http://localhost:9000/score".into());
        assert!(config.validate().is_ok());
    }
}
