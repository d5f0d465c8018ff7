//! Infrastructure layer for persistence, HTTP and external integrations
//!
//! SQLite repositories and the execution lock store, the reqwest fetcher,
//! the default HTML collaborators, the HTTP policy scorer, configuration
//! loading and logging setup.

pub mod config;
pub mod database_connection;
pub mod html_parser;
pub mod http_client;
pub mod lock_store;
pub mod logging;
pub mod policy_scorer;
pub mod repositories;

// Re-export commonly used items
pub use config::AppConfig;
pub use database_connection::DatabaseConnection;
pub use html_parser::{MetaTagClassifier, RegexHtmlCleaner, ScraperPageParser};
pub use http_client::ReqwestFetcher;
pub use lock_store::{LockStore, SqliteLockStore};
pub use logging::{get_log_directory, init_logging_with_config};
pub use policy_scorer::HttpPolicyScorer;
pub use repositories::sqlite_repositories;
