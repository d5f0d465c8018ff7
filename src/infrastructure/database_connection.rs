// Database connection and pool management
// This module handles SQLite database connections using sqlx

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::infrastructure::config::DatabaseConfig;

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS sources (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        base_url TEXT NOT NULL UNIQUE,
        authority_score REAL NOT NULL DEFAULT 0.5,
        priority_weight REAL NOT NULL DEFAULT 0.5,
        entity_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL REFERENCES sources (id),
        url TEXT NOT NULL,
        url_fingerprint TEXT NOT NULL,
        entity_type TEXT,
        page_type TEXT,
        content_type TEXT,
        temporal_class TEXT,
        title TEXT,
        description TEXT,
        thumbnail_url TEXT,
        canonical_url TEXT,
        canonical_number TEXT,
        tags TEXT NOT NULL DEFAULT '[]',
        published_at TEXT,
        content_updated_at TEXT,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        next_due TEXT,
        last_fetched_at TEXT,
        snapshot_count INTEGER NOT NULL DEFAULT 0,
        policy_result TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (source_id, url_fingerprint)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id TEXT NOT NULL REFERENCES entities (id),
        status TEXT NOT NULL,
        version INTEGER NOT NULL,
        http_status INTEGER,
        content_length INTEGER NOT NULL DEFAULT 0,
        link_count INTEGER NOT NULL DEFAULT 0,
        media_count INTEGER NOT NULL DEFAULT 0,
        structured_data_count INTEGER NOT NULL DEFAULT 0,
        content_change_percentage REAL,
        fetch_duration_ms INTEGER NOT NULL DEFAULT 0,
        cost REAL NOT NULL DEFAULT 0,
        error TEXT,
        content_hash TEXT,
        markdown TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (entity_id, version)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS scheduler_locks (
        name TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_entities_status_due ON entities (status, next_due)",
    "CREATE INDEX IF NOT EXISTS idx_entities_source_status ON entities (source_id, status)",
    "CREATE INDEX IF NOT EXISTS idx_snapshots_entity_version ON snapshots (entity_id, version DESC)",
    "CREATE INDEX IF NOT EXISTS idx_sources_updated_at ON sources (updated_at DESC)",
];

pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("Invalid database url: {}", config.url))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create database directory {:?}", parent))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .context("Failed to open SQLite pool")?;

        info!("🗄️ Database connected: {}", config.url);
        Ok(Self { pool })
    }

    /// Opens a database file with default pool settings
    pub async fn open(database_url: &str) -> Result<Self> {
        Self::new(&DatabaseConfig {
            url: database_url.to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates tables and indexes; idempotent
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Schema migration failed")?;
        }
        info!("✅ Database schema ready");
        Ok(())
    }
}
