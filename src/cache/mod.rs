//! Result cache.
//!
//! Backends store [`CacheEntry`] values and may hand back stale entries; the
//! [`Cache`] facade owns the clock and decides freshness. A backend error is
//! never fatal to a run: callers treat it as a miss and log a warning.

mod chained;
mod disk;
mod memo;
mod memory;
mod remote;

pub use chained::ChainedCache;
pub use disk::DiskCache;
pub use memo::Memoizer;
pub use memory::MemoryCache;
pub use remote::{RemoteCache, RemoteCacheConfig};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::time::Clock;

/// Bumped whenever the stored entry layout changes.
pub const ENTRY_VERSION: u32 = 1;

/// Identity of a cached value: a namespace plus a key unique within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub namespace: String,
    pub key: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// Stable hex SHA-256 of the key, used for file and record names.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.key.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

mod ttl_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// A stored value with the metadata needed to judge freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "ttl_ms", with = "ttl_millis")]
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.created_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Served as fresh only while `now < created + ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

/// Errors reported by cache backends.
#[derive(Debug)]
pub enum CacheError {
    /// Filesystem failure
    Io(std::io::Error),

    /// A stored entry could not be decoded
    Corrupt(String),

    /// The remote store could not be reached or refused the operation
    Unavailable(String),

    /// The remote store did not answer in time
    Timeout(Duration),

    /// A value could not be converted to or from its stored form
    Serialization(serde_json::Error),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "Cache I/O error: {}", err),
            Self::Corrupt(message) => write!(f, "Corrupt cache entry: {}", message),
            Self::Unavailable(message) => write!(f, "Cache backend unavailable: {}", message),
            Self::Timeout(after) => write!(f, "Cache backend timed out after {:?}", after),
            Self::Serialization(err) => write!(f, "Cache serialization error: {}", err),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err)
    }
}

/// Storage for cache entries.
///
/// `get` may return expired entries. `set` must replace atomically: a
/// concurrent reader sees either the old or the new entry, never a mix.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Remove the entry. Removing a missing key is not an error.
    async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError>;
}

/// A typed value read back from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub created_at: DateTime<Utc>,
    pub fresh: bool,
}

/// Freshness-aware access to a backend.
#[derive(Clone)]
pub struct Cache {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn decode<T: DeserializeOwned>(&self, entry: CacheEntry) -> Result<Cached<T>, CacheError> {
        let fresh = entry.is_fresh(self.clock.now());
        let value = serde_json::from_value(entry.payload)
            .map_err(|err| CacheError::Corrupt(format!("{}: {}", entry.key, err)))?;
        Ok(Cached {
            value,
            created_at: entry.created_at,
            fresh,
        })
    }

    /// A fresh value, or `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<Cached<T>>, CacheError> {
        match self.get_any(key).await? {
            Some(cached) if cached.fresh => Ok(Some(cached)),
            _ => Ok(None),
        }
    }

    /// Any stored value, fresh or not.
    pub async fn get_any<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
    ) -> Result<Option<Cached<T>>, CacheError> {
        match self.backend.get(key).await? {
            Some(entry) if entry.key == *key => self.decode(entry).map(Some),
            _ => Ok(None),
        }
    }

    /// Store `value`, stamped with the current time.
    pub async fn set<T: Serialize>(&self, key: CacheKey, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let entry = CacheEntry {
            key,
            payload: serde_json::to_value(value)?,
            created_at: self.clock.now(),
            ttl,
        };
        self.backend.set(entry).await
    }

    pub async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.backend.invalidate(key).await
    }
}
