use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use super::{CacheBackend, CacheEntry, CacheError, CacheKey, ENTRY_VERSION};

/// Cache persisted as one JSON file per entry.
///
/// Layout: `<root>/v<version>/<first two hex chars>/<sha256>.json`. Writes go
/// to a temporary file in the same directory and are renamed into place, so
/// readers never observe a partial entry.
#[derive(Debug, Clone)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        let digest = key.digest();
        self.root
            .join(format!("v{}", ENTRY_VERSION))
            .join(&digest[..2])
            .join(format!("{}.json", digest))
    }

    async fn discard(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path).await {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %path.display(), "Failed to remove cache entry: {}", err);
            }
        }
    }
}

#[async_trait]
impl CacheBackend for DiskCache {
    fn name(&self) -> &str {
        "disk"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.key == *key => Ok(Some(entry)),
            Ok(_) => Ok(None),
            Err(err) => {
                self.discard(&path).await;
                Err(CacheError::Corrupt(format!("{}: {}", path.display(), err)))
            }
        }
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let path = self.path_for(&entry.key);
        let Some(dir) = path.parent() else {
            return Err(CacheError::Corrupt(format!("no parent directory for {}", path.display())));
        };
        fs::create_dir_all(dir).await?;

        let bytes = serde_json::to_vec(&entry)?;
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        if let Err(err) = fs::write(&tmp, &bytes).await {
            self.discard(&tmp).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp, &path).await {
            self.discard(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
