//! Repository implementations for the scrape pipeline
//!
//! SQLite implementations of the repository traits in `domain::repositories`.
//! Every multi-row write runs inside one transaction; entity events are
//! emitted only after the transaction committed.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashSet;
use std::sync::Arc;

use crate::domain::entities::{ContentMetrics, Entity, NewSnapshot, ScrapingStatus, Snapshot, Source};
use crate::domain::events::{EntityEvent, EventBus};
use crate::domain::policy_result::PolicyResult;
use crate::domain::repositories::{
    EntityRepository, Repositories, SnapshotRepository, SourceRepository,
};
use crate::domain::retry_state::FailureTransition;
use crate::domain::value_objects::UrlFingerprint;

/// Fixed-width UTC timestamp; sorts correctly as text
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| anyhow!("Failed to parse timestamp '{}': {}", value, e))?
        .with_timezone(&Utc))
}

fn optional_timestamp(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    row.try_get::<Option<String>, _>(column)?
        .as_deref()
        .map(parse_timestamp)
        .transpose()
}

fn status_column(row: &SqliteRow, column: &str) -> Result<ScrapingStatus> {
    let raw: String = row.try_get(column)?;
    raw.parse()
}

/// Builds every repository on one pool and event bus
pub fn sqlite_repositories(pool: SqlitePool, events: EventBus) -> Repositories {
    Repositories {
        sources: Arc::new(SqliteSourceRepository::new(pool.clone())),
        entities: Arc::new(SqliteEntityRepository::new(pool.clone(), events.clone())),
        snapshots: Arc::new(SqliteSnapshotRepository::new(pool, events)),
    }
}

// ============================================================================
// SourceRepository
// ============================================================================

pub struct SqliteSourceRepository {
    pool: SqlitePool,
}

impl SqliteSourceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_source(row: &SqliteRow) -> Result<Source> {
        Ok(Source {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            base_url: row.try_get("base_url")?,
            authority_score: row.try_get("authority_score")?,
            priority_weight: row.try_get("priority_weight")?,
            entity_count: row.try_get::<i64, _>("entity_count")? as u64,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        })
    }
}

#[async_trait]
impl SourceRepository for SqliteSourceRepository {
    async fn upsert_by_base_url(&self, source: &Source) -> Result<Source> {
        sqlx::query(
            r"
            INSERT INTO sources (id, name, base_url, authority_score, priority_weight, entity_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT (base_url) DO UPDATE SET
                name = excluded.name,
                authority_score = excluded.authority_score,
                priority_weight = excluded.priority_weight,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&source.id)
        .bind(&source.name)
        .bind(&source.base_url)
        .bind(source.authority_score)
        .bind(source.priority_weight)
        .bind(format_timestamp(source.created_at))
        .bind(format_timestamp(source.updated_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to upsert source {}", source.base_url))?;

        let row = sqlx::query("SELECT * FROM sources WHERE base_url = ?")
            .bind(&source.base_url)
            .fetch_one(&self.pool)
            .await?;
        Self::row_to_source(&row)
    }

    async fn find_by_id(&self, source_id: &str) -> Result<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_source).transpose()
    }

    async fn list_recently_updated(&self, offset: u64, limit: u64) -> Result<Vec<Source>> {
        let rows = sqlx::query("SELECT * FROM sources ORDER BY updated_at DESC, id ASC LIMIT ? OFFSET ?")
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_source).collect()
    }

    async fn refresh_entity_count(&self, source_id: &str) -> Result<u64> {
        // updated_at stays untouched so sweep ordering is stable
        let count: i64 = sqlx::query_scalar(
            r"
            UPDATE sources
            SET entity_count = (SELECT COUNT(*) FROM entities WHERE source_id = ?1)
            WHERE id = ?1
            RETURNING entity_count
            ",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);

        Ok(count as u64)
    }
}

// ============================================================================
// EntityRepository
// ============================================================================

pub struct SqliteEntityRepository {
    pool: SqlitePool,
    events: EventBus,
}

impl SqliteEntityRepository {
    pub fn new(pool: SqlitePool, events: EventBus) -> Self {
        Self { pool, events }
    }

    async fn insert_in(tx: &mut Transaction<'_, Sqlite>, entity: &Entity) -> Result<bool> {
        let tags = serde_json::to_string(&entity.tags)?;
        let policy_result = entity
            .policy_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r"
            INSERT OR IGNORE INTO entities (
                id, source_id, url, url_fingerprint, entity_type, page_type, content_type,
                temporal_class, title, description, thumbnail_url, canonical_url, canonical_number,
                tags, published_at, content_updated_at, status, attempts, next_due,
                last_fetched_at, snapshot_count, policy_result, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&entity.id)
        .bind(&entity.source_id)
        .bind(entity.url())
        .bind(entity.url_fingerprint().as_str())
        .bind(&entity.entity_type)
        .bind(&entity.page_type)
        .bind(&entity.content_type)
        .bind(&entity.temporal_class)
        .bind(&entity.title)
        .bind(&entity.description)
        .bind(&entity.thumbnail_url)
        .bind(&entity.canonical_url)
        .bind(&entity.canonical_number)
        .bind(tags)
        .bind(entity.published_at.map(format_timestamp))
        .bind(entity.content_updated_at.map(format_timestamp))
        .bind(entity.status.as_str())
        .bind(i64::from(entity.attempts))
        .bind(entity.next_due.map(format_timestamp))
        .bind(entity.last_fetched_at.map(format_timestamp))
        .bind(i64::from(entity.snapshot_count))
        .bind(policy_result)
        .bind(format_timestamp(entity.created_at))
        .bind(format_timestamp(entity.updated_at))
        .execute(&mut **tx)
        .await
        .with_context(|| format!("Failed to insert entity {}", entity.url()))?;

        Ok(result.rows_affected() == 1)
    }

    fn created_event(entity: &Entity) -> EntityEvent {
        EntityEvent::Created {
            entity_id: entity.id.clone(),
            source_id: entity.source_id.clone(),
            at: Utc::now(),
        }
    }
}

pub(crate) fn row_to_entity(row: &SqliteRow) -> Result<Entity> {
    let mut entity = Entity::restore(
        row.try_get("id")?,
        row.try_get("source_id")?,
        row.try_get("url")?,
        UrlFingerprint::from_stored(row.try_get("url_fingerprint")?),
    );

    entity.entity_type = row.try_get("entity_type")?;
    entity.page_type = row.try_get("page_type")?;
    entity.content_type = row.try_get("content_type")?;
    entity.temporal_class = row.try_get("temporal_class")?;
    entity.title = row.try_get("title")?;
    entity.description = row.try_get("description")?;
    entity.thumbnail_url = row.try_get("thumbnail_url")?;
    entity.canonical_url = row.try_get("canonical_url")?;
    entity.canonical_number = row.try_get("canonical_number")?;
    entity.tags = serde_json::from_str(&row.try_get::<String, _>("tags")?)
        .context("Corrupt tags column")?;
    entity.published_at = optional_timestamp(row, "published_at")?;
    entity.content_updated_at = optional_timestamp(row, "content_updated_at")?;
    entity.status = status_column(row, "status")?;
    entity.attempts = row.try_get::<i64, _>("attempts")? as u32;
    entity.next_due = optional_timestamp(row, "next_due")?;
    entity.last_fetched_at = optional_timestamp(row, "last_fetched_at")?;
    entity.snapshot_count = row.try_get::<i64, _>("snapshot_count")? as u32;
    entity.policy_result = row
        .try_get::<Option<String>, _>("policy_result")?
        .as_deref()
        .map(serde_json::from_str::<PolicyResult>)
        .transpose()
        .context("Corrupt policy_result column")?;
    entity.created_at = parse_timestamp(&row.try_get::<String, _>("created_at")?)?;
    entity.updated_at = parse_timestamp(&row.try_get::<String, _>("updated_at")?)?;
    Ok(entity)
}

#[async_trait]
impl EntityRepository for SqliteEntityRepository {
    async fn insert(&self, entity: &Entity) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = Self::insert_in(&mut tx, entity).await?;
        tx.commit().await?;

        if inserted {
            self.events.emit(Self::created_event(entity));
        }
        Ok(inserted)
    }

    async fn find_by_id(&self, entity_id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query("SELECT * FROM entities WHERE id = ?")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_entity).transpose()
    }

    async fn find_by_fingerprint(
        &self,
        source_id: &str,
        fingerprint: &UrlFingerprint,
    ) -> Result<Option<Entity>> {
        let row = sqlx::query("SELECT * FROM entities WHERE source_id = ? AND url_fingerprint = ?")
            .bind(source_id)
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_entity).transpose()
    }

    async fn existing_fingerprints(
        &self,
        source_id: &str,
        fingerprints: &[UrlFingerprint],
    ) -> Result<HashSet<UrlFingerprint>> {
        let mut found = HashSet::new();

        // Stay well below SQLite's bound-parameter limit
        for chunk in fingerprints.chunks(500) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT url_fingerprint FROM entities WHERE source_id = ");
            builder.push_bind(source_id).push(" AND url_fingerprint IN (");
            let mut separated = builder.separated(", ");
            for fingerprint in chunk {
                separated.push_bind(fingerprint.as_str());
            }
            separated.push_unseparated(")");

            let rows: Vec<String> = builder.build_query_scalar::<String>().fetch_all(&self.pool).await?;
            found.extend(rows.into_iter().map(UrlFingerprint::from_stored));
        }

        Ok(found)
    }

    async fn insert_batch(&self, entities: &[Entity]) -> Result<usize> {
        if entities.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut created = Vec::new();
        for entity in entities {
            if Self::insert_in(&mut tx, entity).await? {
                created.push(entity);
            }
        }
        tx.commit().await?;

        for entity in &created {
            self.events.emit(Self::created_event(entity));
        }
        Ok(created.len())
    }

    async fn find_due(
        &self,
        status: ScrapingStatus,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Entity>> {
        let sql = if status == ScrapingStatus::Pending {
            r"
            SELECT * FROM entities
            WHERE status = ? AND (next_due IS NULL OR next_due <= ?)
            ORDER BY next_due ASC, created_at ASC
            LIMIT ?
            "
        } else {
            r"
            SELECT * FROM entities
            WHERE status = ? AND next_due IS NOT NULL AND next_due <= ?
            ORDER BY next_due ASC, created_at ASC
            LIMIT ?
            "
        };

        let rows = sqlx::query(sql)
            .bind(status.as_str())
            .bind(format_timestamp(now))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_entity).collect()
    }

    async fn mark_queued(&self, entity_ids: &[String]) -> Result<Vec<String>> {
        let now = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;
        let mut flipped = Vec::new();

        for entity_id in entity_ids {
            let Some(row) = sqlx::query("SELECT source_id, status FROM entities WHERE id = ?")
                .bind(entity_id)
                .fetch_optional(&mut *tx)
                .await?
            else {
                continue;
            };

            let source_id: String = row.try_get("source_id")?;
            let from = status_column(&row, "status")?;
            if from.is_in_flight() {
                continue;
            }

            let result = sqlx::query(
                "UPDATE entities SET status = 'queued', updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(&now)
            .bind(entity_id)
            .bind(from.as_str())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                flipped.push((entity_id.clone(), source_id, from));
            }
        }
        tx.commit().await?;

        let at = Utc::now();
        Ok(flipped
            .into_iter()
            .map(|(entity_id, source_id, from)| {
                self.events.emit(EntityEvent::StatusChanged {
                    entity_id: entity_id.clone(),
                    source_id,
                    from,
                    to: ScrapingStatus::Queued,
                    at,
                });
                entity_id
            })
            .collect())
    }

    async fn claim_for_fetch(&self, entity_id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query(
            r"
            UPDATE entities SET status = 'fetching', updated_at = ?
            WHERE id = ? AND status = 'queued'
            RETURNING *
            ",
        )
        .bind(format_timestamp(Utc::now()))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to claim entity {entity_id}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let entity = row_to_entity(&row)?;

        self.events.emit(EntityEvent::StatusChanged {
            entity_id: entity.id.clone(),
            source_id: entity.source_id.clone(),
            from: ScrapingStatus::Queued,
            to: ScrapingStatus::Fetching,
            at: entity.updated_at,
        });
        Ok(Some(entity))
    }

    async fn has_planned_scrape(
        &self,
        source_id: &str,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let planned: bool = sqlx::query_scalar(
            r"
            SELECT EXISTS (
                SELECT 1 FROM entities
                WHERE source_id = ? AND status = 'pending' AND attempts < ?
                  AND (next_due IS NULL OR next_due <= ?)
            )
            ",
        )
        .bind(source_id)
        .bind(i64::from(max_attempts))
        .bind(format_timestamp(now))
        .fetch_one(&self.pool)
        .await?;

        Ok(planned)
    }

    async fn reset_in_flight(&self) -> Result<u64> {
        let now = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;
        let reset = sqlx::query(
            "UPDATE entities SET status = 'pending', updated_at = ? WHERE status IN ('queued', 'fetching')",
        )
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        // content committed but the policy step never ran
        let unplanned = sqlx::query(
            "UPDATE entities SET next_due = ?, updated_at = ? WHERE status = 'success' AND next_due IS NULL",
        )
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(reset.rows_affected() + unplanned.rows_affected())
    }

    async fn reset_entity(&self, entity_id: &str) -> Result<bool> {
        let Some(entity) = self.find_by_id(entity_id).await? else {
            return Ok(false);
        };
        if entity.status.is_in_flight() {
            return Ok(false);
        }

        let result = sqlx::query(
            r"
            UPDATE entities SET status = 'pending', attempts = 0, next_due = NULL, updated_at = ?
            WHERE id = ? AND status = ?
            ",
        )
        .bind(format_timestamp(Utc::now()))
        .bind(entity_id)
        .bind(entity.status.as_str())
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected() == 1;
        if reset {
            self.events.emit(EntityEvent::StatusChanged {
                entity_id: entity.id,
                source_id: entity.source_id,
                from: entity.status,
                to: ScrapingStatus::Pending,
                at: Utc::now(),
            });
        }
        Ok(reset)
    }

    async fn count_by_status(&self, status: ScrapingStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entities WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }
}

// ============================================================================
// SnapshotRepository
// ============================================================================

pub struct SqliteSnapshotRepository {
    pool: SqlitePool,
    events: EventBus,
}

impl SqliteSnapshotRepository {
    pub fn new(pool: SqlitePool, events: EventBus) -> Self {
        Self { pool, events }
    }

    fn row_to_snapshot(row: &SqliteRow) -> Result<Snapshot> {
        Ok(Snapshot {
            id: row.try_get("id")?,
            entity_id: row.try_get("entity_id")?,
            status: status_column(row, "status")?,
            version: row.try_get::<i64, _>("version")? as u32,
            http_status: row.try_get::<Option<i64>, _>("http_status")?.map(|s| s as u16),
            metrics: ContentMetrics {
                content_length: row.try_get::<i64, _>("content_length")? as u64,
                link_count: row.try_get::<i64, _>("link_count")? as u32,
                media_count: row.try_get::<i64, _>("media_count")? as u32,
                structured_data_count: row.try_get::<i64, _>("structured_data_count")? as u32,
                content_change_percentage: row.try_get("content_change_percentage")?,
            },
            fetch_duration_ms: row.try_get::<i64, _>("fetch_duration_ms")? as u64,
            cost: row.try_get("cost")?,
            error: row.try_get("error")?,
            content_hash: row.try_get("content_hash")?,
            markdown: row.try_get("markdown")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        })
    }

    /// Assigns `MAX(version) + 1` and appends the snapshot inside `tx`
    async fn append_in(
        tx: &mut Transaction<'_, Sqlite>,
        snapshot: NewSnapshot,
        created_at: DateTime<Utc>,
    ) -> Result<Snapshot> {
        let version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM snapshots WHERE entity_id = ?",
        )
        .bind(&snapshot.entity_id)
        .fetch_one(&mut **tx)
        .await?;

        let metrics = &snapshot.metrics;
        let result = sqlx::query(
            r"
            INSERT INTO snapshots (
                entity_id, status, version, http_status, content_length, link_count, media_count,
                structured_data_count, content_change_percentage, fetch_duration_ms, cost, error,
                content_hash, markdown, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&snapshot.entity_id)
        .bind(snapshot.status.as_str())
        .bind(version)
        .bind(snapshot.http_status.map(i64::from))
        .bind(metrics.content_length as i64)
        .bind(i64::from(metrics.link_count))
        .bind(i64::from(metrics.media_count))
        .bind(i64::from(metrics.structured_data_count))
        .bind(metrics.content_change_percentage)
        .bind(snapshot.fetch_duration_ms as i64)
        .bind(snapshot.cost)
        .bind(&snapshot.error)
        .bind(&snapshot.content_hash)
        .bind(&snapshot.markdown)
        .bind(format_timestamp(created_at))
        .execute(&mut **tx)
        .await
        .with_context(|| format!("Failed to append snapshot for entity {}", snapshot.entity_id))?;

        Ok(Snapshot {
            id: result.last_insert_rowid(),
            entity_id: snapshot.entity_id,
            status: snapshot.status,
            version: version as u32,
            http_status: snapshot.http_status,
            metrics: snapshot.metrics,
            fetch_duration_ms: snapshot.fetch_duration_ms,
            cost: snapshot.cost,
            error: snapshot.error,
            content_hash: snapshot.content_hash,
            markdown: snapshot.markdown,
            created_at,
        })
    }

    fn emit_transition(&self, entity: &Entity, snapshot: &Snapshot) {
        if entity.status != snapshot.status {
            self.events.emit(EntityEvent::StatusChanged {
                entity_id: entity.id.clone(),
                source_id: entity.source_id.clone(),
                from: entity.status,
                to: snapshot.status,
                at: snapshot.created_at,
            });
        }
        self.events.emit(EntityEvent::SnapshotRecorded {
            entity_id: entity.id.clone(),
            source_id: entity.source_id.clone(),
            version: snapshot.version,
            status: snapshot.status,
            at: snapshot.created_at,
        });
    }
}

#[async_trait]
impl SnapshotRepository for SqliteSnapshotRepository {
    async fn recent_for_entity(&self, entity_id: &str, limit: u32) -> Result<Vec<Snapshot>> {
        let rows = sqlx::query(
            "SELECT * FROM snapshots WHERE entity_id = ? ORDER BY version DESC LIMIT ?",
        )
        .bind(entity_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_snapshot).collect()
    }

    async fn count_for_entity(&self, entity_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots WHERE entity_id = ?")
            .bind(entity_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }

    async fn latest_successful_markdown(&self, entity_id: &str) -> Result<Option<String>> {
        let markdown: Option<String> = sqlx::query_scalar(
            r"
            SELECT markdown FROM snapshots
            WHERE entity_id = ? AND status = 'success' AND markdown IS NOT NULL
            ORDER BY version DESC
            LIMIT 1
            ",
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(markdown)
    }

    async fn record_failure(
        &self,
        entity: &Entity,
        snapshot: NewSnapshot,
        transition: &FailureTransition,
    ) -> Result<Snapshot> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let snapshot = Self::append_in(&mut tx, snapshot, now).await?;
        sqlx::query(
            r"
            UPDATE entities
            SET status = ?, attempts = ?, next_due = ?, last_fetched_at = ?,
                snapshot_count = snapshot_count + 1, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(transition.status.as_str())
        .bind(i64::from(transition.attempts))
        .bind(transition.next_due.map(format_timestamp))
        .bind(format_timestamp(now))
        .bind(format_timestamp(now))
        .bind(&entity.id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to apply failure transition to {}", entity.id))?;

        tx.commit().await?;
        self.emit_transition(entity, &snapshot);
        Ok(snapshot)
    }

    async fn persist_content(&self, entity: &Entity, snapshot: NewSnapshot) -> Result<Snapshot> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let snapshot = Self::append_in(&mut tx, snapshot, now).await?;
        sqlx::query(
            r"
            UPDATE entities
            SET status = 'success', attempts = 0, next_due = NULL,
                entity_type = ?, page_type = ?, content_type = ?, temporal_class = ?,
                title = ?, description = ?, thumbnail_url = ?, canonical_url = ?,
                canonical_number = ?, tags = ?,
                published_at = ?, content_updated_at = ?,
                last_fetched_at = ?, snapshot_count = snapshot_count + 1, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&entity.entity_type)
        .bind(&entity.page_type)
        .bind(&entity.content_type)
        .bind(&entity.temporal_class)
        .bind(&entity.title)
        .bind(&entity.description)
        .bind(&entity.thumbnail_url)
        .bind(&entity.canonical_url)
        .bind(&entity.canonical_number)
        .bind(serde_json::to_string(&entity.tags)?)
        .bind(entity.published_at.map(format_timestamp))
        .bind(entity.content_updated_at.map(format_timestamp))
        .bind(format_timestamp(now))
        .bind(format_timestamp(now))
        .bind(&entity.id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to persist content for {}", entity.id))?;

        tx.commit().await?;
        self.emit_transition(entity, &snapshot);
        Ok(snapshot)
    }

    async fn persist_policy(&self, entity_id: &str, result: &PolicyResult) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE entities SET next_due = ?, policy_result = ?, updated_at = ? WHERE id = ?")
            .bind(format_timestamp(result.next_visit_at()))
            .bind(serde_json::to_string(result)?)
            .bind(format_timestamp(Utc::now()))
            .bind(entity_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to persist policy for {entity_id}"))?;
        tx.commit().await?;
        Ok(())
    }
}
