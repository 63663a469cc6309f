use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{CacheBackend, CacheEntry, CacheError, CacheKey};

/// Default upper bound on stored entries.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Process-local cache. Lost on restart.
///
/// Holds at most `max_entries`; inserting a new key into a full cache evicts
/// the entry that expires first.
#[derive(Debug)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    max_entries: usize,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.lock().get(key).cloned())
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.lock();
        if !entries.contains_key(&entry.key) && entries.len() >= self.max_entries {
            let evict = entries
                .values()
                .min_by_key(|stored| stored.expires_at())
                .map(|stored| stored.key.clone());
            if let Some(evict) = evict {
                debug!(key = %evict, "Evicting memory cache entry");
                entries.remove(&evict);
            }
        }
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.lock().remove(key);
        Ok(())
    }
}
