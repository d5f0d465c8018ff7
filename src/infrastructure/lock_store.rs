//! Execution lock with a safety TTL
//!
//! Backed by the `scheduler_locks` table. Acquisition is a single atomic
//! upsert that only takes over a row whose lease already expired, so a
//! crashed holder never blocks the loop for longer than the TTL.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::debug;

use crate::infrastructure::repositories::format_timestamp;

/// Process-wide mutual exclusion keyed by name
#[async_trait]
pub trait LockStore: Send + Sync {
    /// True when `owner` now holds `name` for `ttl`
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool>;
    /// Releases `name` if `owner` still holds it
    async fn release(&self, name: &str, owner: &str) -> Result<bool>;
}

pub struct SqliteLockStore {
    pool: SqlitePool,
}

impl SqliteLockStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockStore for SqliteLockStore {
    async fn try_acquire(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).context("Lock TTL out of range")?;

        let result = sqlx::query(
            r"
            INSERT INTO scheduler_locks (name, owner, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (name) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE scheduler_locks.expires_at <= ?4
            ",
        )
        .bind(name)
        .bind(owner)
        .bind(format_timestamp(now + ttl))
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to acquire lock {name}"))?;

        let acquired = result.rows_affected() == 1;
        debug!(lock = name, owner, acquired, "Lock acquisition attempted");
        Ok(acquired)
    }

    async fn release(&self, name: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduler_locks WHERE name = ? AND owner = ?")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to release lock {name}"))?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database_connection::DatabaseConnection;

    async fn store() -> (tempfile::TempDir, SqliteLockStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("locks.db").display());
        let db = DatabaseConnection::open(&url).await.unwrap();
        db.migrate().await.unwrap();
        (dir, SqliteLockStore::new(db.pool().clone()))
    }

    #[tokio::test]
    async fn second_owner_is_rejected_while_lease_is_live() {
        let (_dir, locks) = store().await;
        let ttl = Duration::from_secs(300);

        assert!(locks.try_acquire("scheduler", "a", ttl).await.unwrap());
        assert!(!locks.try_acquire("scheduler", "b", ttl).await.unwrap());
        assert!(!locks.release("scheduler", "b").await.unwrap());
        assert!(locks.release("scheduler", "a").await.unwrap());
        assert!(locks.try_acquire("scheduler", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let (_dir, locks) = store().await;

        assert!(locks.try_acquire("scheduler", "crashed", Duration::ZERO).await.unwrap());
        assert!(locks.try_acquire("scheduler", "next", Duration::from_secs(60)).await.unwrap());
        // the crashed holder no longer owns it
        assert!(!locks.release("scheduler", "crashed").await.unwrap());
    }
}
