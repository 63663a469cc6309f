use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::{CacheBackend, CacheEntry, CacheError, CacheKey};
use crate::time::Clock;

/// Tiered cache: reads try each tier in order, writes go to every tier.
///
/// A stale hit does not end the search, so a fresh entry written to a shared
/// tier by another replica is found behind an expired local copy. Fresh hits
/// in a later tier are copied into all earlier tiers. When no tier has a
/// fresh entry the newest stale one is returned.
pub struct ChainedCache {
    tiers: Vec<Arc<dyn CacheBackend>>,
    clock: Arc<dyn Clock>,
    name: String,
}

impl ChainedCache {
    pub fn new(tiers: Vec<Arc<dyn CacheBackend>>, clock: Arc<dyn Clock>) -> Self {
        let name = format!(
            "chained({})",
            tiers.iter().map(|t| t.name()).collect::<Vec<_>>().join(",")
        );
        Self { tiers, clock, name }
    }

    async fn back_fill(&self, upto: usize, entry: &CacheEntry) {
        for earlier in &self.tiers[..upto] {
            if let Err(err) = earlier.set(entry.clone()).await {
                warn!(tier = earlier.name(), key = %entry.key, "Cache back-fill failed: {}", err);
            }
        }
    }
}

#[async_trait]
impl CacheBackend for ChainedCache {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.clock.now();
        let mut newest_stale: Option<CacheEntry> = None;
        let mut last_error = None;

        for (position, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(Some(entry)) if entry.is_fresh(now) => {
                    self.back_fill(position, &entry).await;
                    return Ok(Some(entry));
                }
                Ok(Some(entry)) => {
                    if newest_stale
                        .as_ref()
                        .is_none_or(|stale| stale.created_at < entry.created_at)
                    {
                        newest_stale = Some(entry);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(tier = tier.name(), key = %key, "Cache tier read failed: {}", err);
                    last_error = Some(err);
                }
            }
        }

        match (newest_stale, last_error) {
            (Some(stale), _) => Ok(Some(stale)),
            (None, Some(err)) => Err(err),
            (None, None) => Ok(None),
        }
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut first_error = None;
        for tier in &self.tiers {
            if let Err(err) = tier.set(entry.clone()).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut first_error = None;
        for tier in &self.tiers {
            if let Err(err) = tier.invalidate(key).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
