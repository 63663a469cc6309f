use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{Cache, CacheKey};

/// Get-or-compute helper over a [`Cache`], for datasources and other
/// callers that want to cache their own intermediate values.
///
/// Cache failures fall back to computing. Computation errors are returned
/// and never stored.
#[derive(Clone)]
pub struct Memoizer {
    cache: Cache,
    namespace: String,
}

impl Memoizer {
    pub fn new(cache: Cache, namespace: impl Into<String>) -> Self {
        Self {
            cache,
            namespace: format!("memo:{}", namespace.into()),
        }
    }

    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let key = CacheKey::new(self.namespace.clone(), key);

        match self.cache.get::<T>(&key).await {
            Ok(Some(cached)) => return Ok(cached.value),
            Ok(None) => {}
            Err(err) => warn!(key = %key, "Memoized lookup failed, recomputing: {}", err),
        }

        let value = compute().await?;
        if let Err(err) = self.cache.set(key.clone(), &value, ttl).await {
            warn!(key = %key, "Failed to store memoized value: {}", err);
        }
        Ok(value)
    }

    pub async fn invalidate(&self, key: &str) -> anyhow::Result<()> {
        self.cache
            .invalidate(&CacheKey::new(self.namespace.clone(), key))
            .await?;
        Ok(())
    }
}
