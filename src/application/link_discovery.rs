//! Same-host link discovery
//!
//! Turns the links of a fetched page into new PENDING entities of the same
//! source. Cross-host links and URLs that are already tracked are dropped.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::entities::Entity;
use crate::domain::repositories::EntityRepository;
use crate::domain::value_objects::{NormalizedUrl, UrlFingerprint};

pub struct LinkDiscovery {
    entities: Arc<dyn EntityRepository>,
    max_links_per_page: usize,
}

impl LinkDiscovery {
    pub fn new(entities: Arc<dyn EntityRepository>, max_links_per_page: usize) -> Self {
        Self {
            entities,
            max_links_per_page,
        }
    }

    /// Normalized same-host candidates, unique by fingerprint, page itself excluded
    pub fn candidates(entity: &Entity, links: &[String], limit: usize) -> Vec<NormalizedUrl> {
        let Some(host) = entity.host() else {
            return Vec::new();
        };

        let mut seen: HashSet<UrlFingerprint> = HashSet::new();
        seen.insert(entity.url_fingerprint().clone());
        if let Ok(own) = NormalizedUrl::parse(entity.url()) {
            seen.insert(own.fingerprint());
        }

        links
            .iter()
            .filter_map(|raw| NormalizedUrl::parse(raw).ok())
            .filter(|url| url.is_same_host(&host))
            .filter(|url| seen.insert(url.fingerprint()))
            .take(limit)
            .collect()
    }

    /// Creates entities for unseen links; returns how many were created
    pub async fn discover(&self, entity: &Entity, links: &[String]) -> Result<usize> {
        let candidates = Self::candidates(entity, links, self.max_links_per_page);
        if candidates.is_empty() {
            return Ok(0);
        }

        let fingerprints: Vec<UrlFingerprint> =
            candidates.iter().map(NormalizedUrl::fingerprint).collect();
        let existing = self
            .entities
            .existing_fingerprints(&entity.source_id, &fingerprints)
            .await?;

        let fresh: Vec<Entity> = candidates
            .iter()
            .filter(|url| !existing.contains(&url.fingerprint()))
            .map(|url| Entity::new(entity.source_id.clone(), url.as_str()))
            .collect();

        if fresh.is_empty() {
            debug!(entity_id = %entity.id, "No new links discovered");
            return Ok(0);
        }

        // INSERT OR IGNORE also covers links another worker created meanwhile
        let created = self.entities.insert_batch(&fresh).await?;
        info!(
            entity_id = %entity.id,
            source_id = %entity.source_id,
            created,
            "🔗 Discovered new same-host links"
        );
        Ok(created)
    }
}
