use std::{sync::Arc, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use super::services::EntityService;
use crate::{
    cache::EntityCache,
    entity::{Authenticatable, EntityId, EntityKind},
    error::{AppError, AppResult},
};

/// Cached value: the entity's public view tagged with its kind, so a key
/// that happens to be looked up under the other kind is not served.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    kind: EntityKind,
    entity: Value,
}

/// Get-or-populate reads in front of [`EntityService::get_entity`].
#[derive(Clone)]
pub struct CachedReader {
    cache: Arc<dyn EntityCache>,
    service: EntityService,
    ttl: Duration,
}

impl CachedReader {
    pub fn new(cache: Arc<dyn EntityCache>, service: EntityService, ttl: Duration) -> Self {
        Self {
            cache,
            service,
            ttl,
        }
    }

    /// A hit never touches the primary store. A clean miss reads the store
    /// and populates the cache once. Any other cache error is surfaced as
    /// an infrastructure failure, never as "not found".
    #[instrument(skip(self))]
    pub async fn get_by_id(
        &self,
        id: EntityId,
        kind: EntityKind,
    ) -> AppResult<Box<dyn Authenticatable>> {
        let key = id.to_hex();

        let cached = self
            .cache
            .get(&key)
            .await
            .context("read entity cache")
            .map_err(AppError::Infrastructure)?;

        if let Some(raw) = cached {
            let snapshot: Snapshot =
                serde_json::from_str(&raw).context("decode cached entity snapshot")?;
            if snapshot.kind == kind {
                debug!(entity_id = %id, "cache hit");
                return Ok(kind.from_snapshot(snapshot.entity)?);
            }
            warn!(entity_id = %id, cached_kind = %snapshot.kind, "cache entry belongs to another kind");
        } else {
            debug!(entity_id = %id, "cache miss");
        }

        let entity = self.service.get_entity(id, kind).await?;

        // the store already answered; a failed cache write must not fail the read
        match self.snapshot(entity.as_ref()) {
            Ok(raw) => {
                if let Err(e) = self.cache.set(&key, &raw, self.ttl).await {
                    error!(entity_id = %id, error = %format!("{e:#}"), "failed to populate entity cache");
                }
            }
            Err(e) => {
                error!(entity_id = %id, error = %format!("{e:#}"), "failed to build cache snapshot")
            }
        }
        Ok(entity)
    }

    /// Best-effort removal after a write; stale entries otherwise live until
    /// their TTL.
    pub async fn invalidate(&self, id: EntityId) {
        if let Err(e) = self.cache.invalidate(&id.to_hex()).await {
            warn!(entity_id = %id, error = %format!("{e:#}"), "failed to invalidate entity cache");
        }
    }

    fn snapshot(&self, entity: &dyn Authenticatable) -> anyhow::Result<String> {
        let snapshot = Snapshot {
            kind: entity.kind(),
            entity: entity.public_view()?,
        };
        serde_json::to_string(&snapshot).context("encode entity snapshot")
    }
}
