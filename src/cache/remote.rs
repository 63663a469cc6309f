use std::future::IntoFuture;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use tracing::{debug, info, warn};

use super::{CacheBackend, CacheEntry, CacheError, CacheKey, ENTRY_VERSION};

const TABLE: &str = "cache_entry";

/// Connection settings for the shared cache.
#[derive(Debug, Clone)]
pub struct RemoteCacheConfig {
    /// SurrealDB endpoint, e.g. `ws://cache:8000` or `memory`.
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Separates several watchpost deployments sharing one database.
    pub key_infix: Option<String>,
    /// Extra time expired entries are kept for reuse by skipped checks.
    pub retention: Duration,
    /// Upper bound for every single cache operation.
    pub operation_timeout: Duration,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            url: "memory".to_string(),
            namespace: "watchpost".to_string(),
            database: "cache".to_string(),
            username: None,
            password: None,
            key_infix: None,
            retention: Duration::from_secs(3600),
            operation_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    namespace: String,
    key: String,
    payload: String,
    created_at_ms: i64,
    ttl_ms: u64,
    expires_at_ms: i64,
}

/// Cache shared across replicas through SurrealDB.
///
/// Records carry `expires_at_ms = created + ttl + retention`. Records past that
/// point are never returned and are swept on every write.
#[derive(Clone)]
pub struct RemoteCache {
    db: Surreal<Any>,
    key_infix: Option<String>,
    retention: Duration,
    timeout: Duration,
}

impl RemoteCache {
    /// Connect, sign in if credentials are given and select namespace/database.
    pub async fn connect(config: RemoteCacheConfig) -> anyhow::Result<Self> {
        let db = surrealdb::engine::any::connect(config.url.as_str()).await?;

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await?;
        }

        db.use_ns(config.namespace.as_str())
            .use_db(config.database.as_str())
            .await?;

        info!(url = %config.url, "Connected to remote cache");
        Ok(Self::from_db(db, &config))
    }

    pub fn from_db(db: Surreal<Any>, config: &RemoteCacheConfig) -> Self {
        Self {
            db,
            key_infix: config.key_infix.clone().filter(|infix| !infix.is_empty()),
            retention: config.retention,
            timeout: config.operation_timeout,
        }
    }

    fn record_id(&self, key: &CacheKey) -> String {
        match &self.key_infix {
            Some(infix) => format!("{}_v{}_{}", infix, ENTRY_VERSION, key.digest()),
            None => format!("v{}_{}", ENTRY_VERSION, key.digest()),
        }
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, CacheError>
    where
        F: IntoFuture<Output = Result<T, surrealdb::Error>>,
    {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(CacheError::Unavailable(err.to_string())),
            Err(_) => Err(CacheError::Timeout(self.timeout)),
        }
    }

    /// Delete every record past its retention.
    async fn sweep_expired(&self) -> Result<(), CacheError> {
        let now = Utc::now().timestamp_millis();
        let response = self
            .bounded(
                self.db
                    .query("DELETE cache_entry WHERE expires_at_ms <= $now")
                    .bind(("now", now)),
            )
            .await?;
        response
            .check()
            .map_err(|err| CacheError::Unavailable(err.to_string()))?;
        Ok(())
    }

    fn millis(duration: Duration) -> i64 {
        i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl CacheBackend for RemoteCache {
    fn name(&self) -> &str {
        "remote"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let id = self.record_id(key);
        let stored: Option<StoredEntry> = self.bounded(self.db.select((TABLE, id.as_str()))).await?;
        let Some(stored) = stored else {
            return Ok(None);
        };

        if stored.expires_at_ms <= Utc::now().timestamp_millis() {
            debug!(key = %key, "Remote cache entry past retention");
            return Ok(None);
        }
        if stored.namespace != key.namespace || stored.key != key.key {
            return Ok(None);
        }

        let created_at = DateTime::<Utc>::from_timestamp_millis(stored.created_at_ms)
            .ok_or_else(|| CacheError::Corrupt(format!("{}: invalid timestamp", key)))?;
        let payload = serde_json::from_str(&stored.payload)
            .map_err(|err| CacheError::Corrupt(format!("{}: {}", key, err)))?;

        Ok(Some(CacheEntry {
            key: key.clone(),
            payload,
            created_at,
            ttl: Duration::from_millis(stored.ttl_ms),
        }))
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let id = self.record_id(&entry.key);
        let created_at_ms = entry.created_at.timestamp_millis();
        let stored = StoredEntry {
            namespace: entry.key.namespace.clone(),
            key: entry.key.key.clone(),
            payload: serde_json::to_string(&entry.payload)?,
            created_at_ms,
            ttl_ms: u64::try_from(entry.ttl.as_millis()).unwrap_or(u64::MAX),
            expires_at_ms: created_at_ms
                .saturating_add(Self::millis(entry.ttl))
                .saturating_add(Self::millis(self.retention)),
        };

        let _: Option<StoredEntry> = self
            .bounded(self.db.upsert((TABLE, id.as_str())).content(stored))
            .await?;

        // Sweep failures never fail the store.
        if let Err(err) = self.sweep_expired().await {
            warn!("Remote cache sweep failed: {}", err);
        }
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        let id = self.record_id(key);
        let _: Option<StoredEntry> = self.bounded(self.db.delete((TABLE, id.as_str()))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::entry;
    use serde_json::json;

    async fn memory_cache(retention: Duration) -> RemoteCache {
        RemoteCache::connect(RemoteCacheConfig {
            retention,
            ..Default::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn round_trips_entries() {
        let cache = memory_cache(Duration::from_secs(60)).await;
        let stored = entry("k", json!({"summary": "up"}), 300);
        cache.set(stored.clone()).await.unwrap();

        let loaded = cache.get(&stored.key).await.unwrap().unwrap();
        assert_eq!(loaded.payload, stored.payload);
        assert_eq!(loaded.ttl, stored.ttl);
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            stored.created_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn entries_past_retention_are_gone() {
        let cache = memory_cache(Duration::ZERO).await;
        let mut old = entry("k", json!(1), 1);
        old.created_at = Utc::now() - chrono::Duration::seconds(10);
        cache.set(old.clone()).await.unwrap();

        assert!(cache.get(&old.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_entries_within_retention_are_returned() {
        let cache = memory_cache(Duration::from_secs(3600)).await;
        let mut old = entry("k", json!(1), 1);
        old.created_at = Utc::now() - chrono::Duration::seconds(10);
        cache.set(old.clone()).await.unwrap();

        let loaded = cache.get(&old.key).await.unwrap().unwrap();
        assert!(!loaded.is_fresh(Utc::now()));
    }

    #[tokio::test]
    async fn infix_separates_deployments() {
        let db = surrealdb::engine::any::connect("memory").await.unwrap();
        db.use_ns("watchpost").use_db("cache").await.unwrap();
        let a = RemoteCache::from_db(
            db.clone(),
            &RemoteCacheConfig {
                key_infix: Some("a".into()),
                ..Default::default()
            },
        );
        let b = RemoteCache::from_db(
            db,
            &RemoteCacheConfig {
                key_infix: Some("b".into()),
                ..Default::default()
            },
        );

        let stored = entry("k", json!(1), 60);
        a.set(stored.clone()).await.unwrap();
        assert!(a.get(&stored.key).await.unwrap().is_some());
        assert!(b.get(&stored.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalidate_is_idempotent() {
        let cache = memory_cache(Duration::from_secs(60)).await;
        let stored = entry("k", json!(1), 60);
        cache.set(stored.clone()).await.unwrap();
        cache.invalidate(&stored.key).await.unwrap();
        cache.invalidate(&stored.key).await.unwrap();
        assert!(cache.get(&stored.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_sweep_other_expired_records() {
        let cache = memory_cache(Duration::ZERO).await;
        let expired_key = CacheKey::new("test", "expired");
        let expired_id = cache.record_id(&expired_key);
        let _: Option<StoredEntry> = cache
            .db
            .upsert((TABLE, expired_id.as_str()))
            .content(StoredEntry {
                namespace: expired_key.namespace.clone(),
                key: expired_key.key.clone(),
                payload: "1".into(),
                created_at_ms: 0,
                ttl_ms: 1000,
                expires_at_ms: 1000,
            })
            .await
            .unwrap();

        let fresh = entry("fresh", json!(1), 60);
        cache.set(fresh.clone()).await.unwrap();

        let remaining: Vec<StoredEntry> = cache.db.select(TABLE).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, "fresh");
        assert!(cache.sweep_expired().await.is_ok());
    }
}
