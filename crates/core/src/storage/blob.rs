//! Content-addressed archive of execution seeds and stage outputs. Events
//! carry only the hash; the payload lives here.

use crate::types::BlobHash;
use anyhow::{Context, Result};
use bytes::Bytes;
use object_store::{path::Path as ObjectPath, ObjectStore, PutMode};
use serde_json::Value;
use std::path::PathBuf;

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under its SHA-256 hash. Storing the same bytes twice is a
    /// no-op.
    async fn put(&self, data: Bytes) -> Result<BlobHash>;

    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>>;

    async fn contains(&self, hash: &BlobHash) -> Result<bool>;

    async fn put_json(&self, value: &Value) -> Result<BlobHash> {
        let data = serde_json::to_vec(value).context("Failed to serialize payload")?;
        self.put(Bytes::from(data)).await
    }

    async fn get_json(&self, hash: &BlobHash) -> Result<Option<Value>> {
        let Some(data) = self.get(hash).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&data)
            .with_context(|| format!("Blob {} is not valid JSON", hash.0))?;
        Ok(Some(value))
    }
}

/// Two-character fan-out directory for a hash
fn shard(hash: &BlobHash) -> &str {
    hash.0.get(..2).unwrap_or("__")
}

/// Blobs as files under `<base>/<shard>/<hash>`
#[derive(Clone)]
pub struct FilesystemBlobStore {
    base_path: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)
            .with_context(|| format!("Failed to create blob directory {}", base_path.display()))?;
        Ok(Self { base_path })
    }

    fn path_of(&self, hash: &BlobHash) -> PathBuf {
        self.base_path.join(shard(hash)).join(&hash.0)
    }
}

#[async_trait::async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, data: Bytes) -> Result<BlobHash> {
        let hash = BlobHash::from_bytes(&data);
        if self.contains(&hash).await? {
            return Ok(hash);
        }

        let dir = self.base_path.join(shard(&hash));
        tokio::fs::create_dir_all(&dir)
            .await
            .context("Failed to create blob shard directory")?;

        // Readers never observe a partially written blob
        let staging = dir.join(format!(".{}.{}", hash.0, uuid::Uuid::new_v4()));
        tokio::fs::write(&staging, &data)
            .await
            .context("Failed to write blob")?;
        tokio::fs::rename(&staging, self.path_of(&hash))
            .await
            .context("Failed to move blob into place")?;

        Ok(hash)
    }

    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.path_of(hash)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read blob {}", hash.0)),
        }
    }

    async fn contains(&self, hash: &BlobHash) -> Result<bool> {
        tokio::fs::try_exists(self.path_of(hash))
            .await
            .context("Failed to stat blob")
    }
}

/// Blobs in any `object_store` backend (S3, GCS, in-memory, ...)
pub struct ObjectStoreBlobStore {
    store: Box<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreBlobStore {
    pub fn new(store: Box<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(object_store::memory::InMemory::new()), "mediaflow")
    }

    fn location(&self, hash: &BlobHash) -> ObjectPath {
        ObjectPath::from(format!("{}/blobs/{}/{}", self.prefix, shard(hash), hash.0))
    }
}

#[async_trait::async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn put(&self, data: Bytes) -> Result<BlobHash> {
        let hash = BlobHash::from_bytes(&data);
        let location = self.location(&hash);

        match self
            .store
            .put_opts(&location, data.into(), PutMode::Create.into())
            .await
        {
            Ok(_) | Err(object_store::Error::AlreadyExists { .. }) => Ok(hash),
            Err(e) => Err(e).with_context(|| format!("Failed to store blob {}", hash.0)),
        }
    }

    async fn get(&self, hash: &BlobHash) -> Result<Option<Bytes>> {
        match self.store.get(&self.location(hash)).await {
            Ok(result) => Ok(Some(
                result.bytes().await.context("Failed to read blob body")?,
            )),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to fetch blob {}", hash.0)),
        }
    }

    async fn contains(&self, hash: &BlobHash) -> Result<bool> {
        match self.store.head(&self.location(hash)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e).context("Failed to stat blob"),
        }
    }
}
