use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::NaiveDateTime;
use futures::StreamExt;
use object_store::ObjectStore;
use shared_types::KeyInfo;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::{ObjectClient, ObjectHeaders, CONTENT_LENGTH, LAST_MODIFIED, RFC1123};
use super::config::StorageConfig;
use super::error::{Result, StorageError};
use super::keyspace::KeySpace;
use super::traits::CertStorage;
use crate::lock::{
    DistributedMutex, LockCache, LockCacheStats, LockOptions, MutexError, MutexFactory,
    ObjectMutexFactory,
};

/// [`CertStorage`] on one bucket of an object store, optionally below a
/// key prefix. Locks are lease objects in the same key space.
pub struct ObjectStoreBackend {
    client: ObjectClient,
    keyspace: KeySpace,
    locks: LockCache,
}

impl ObjectStoreBackend {
    /// Opens `path` (`bucket[/prefix]`) and verifies the bucket is readable
    /// and writable before returning.
    pub async fn new(config: &StorageConfig, path: &str, options: LockOptions) -> Result<Self> {
        let keyspace = KeySpace::parse(path);
        let client = ObjectClient::connect(config, keyspace.bucket()).map_err(|e| {
            StorageError::init(format!("connecting to bucket {}", keyspace.bucket()), e)
        })?;

        Self::open(client, keyspace, options).await
    }

    /// Like [`Self::new`], on an already built store.
    pub async fn with_store(
        store: Arc<dyn ObjectStore>,
        path: &str,
        options: LockOptions,
    ) -> Result<Self> {
        let keyspace = KeySpace::parse(path);
        let client = ObjectClient::from_store(store, keyspace.bucket());

        Self::open(client, keyspace, options).await
    }

    async fn open(client: ObjectClient, keyspace: KeySpace, options: LockOptions) -> Result<Self> {
        options
            .validate()
            .map_err(|e| StorageError::init("invalid lock options", e))?;

        client
            .test_permissions(keyspace.prefix())
            .await
            .map_err(|e| {
                StorageError::init(
                    format!("permission check on bucket {}", keyspace.bucket()),
                    e,
                )
            })?;

        info!(
            bucket = %keyspace.bucket(),
            prefix = %keyspace.prefix(),
            "certificate storage ready"
        );

        let factory = Arc::new(ObjectMutexFactory::new(client.clone(), options));
        Ok(Self {
            client,
            keyspace,
            locks: LockCache::new(factory),
        })
    }

    /// Replaces how lock handles are built, dropping any cached handles.
    pub fn with_mutex_factory(mut self, factory: Arc<dyn MutexFactory>) -> Self {
        self.locks = LockCache::new(factory);
        self
    }

    pub fn bucket(&self) -> &str {
        self.keyspace.bucket()
    }

    pub fn prefix(&self) -> &str {
        self.keyspace.prefix()
    }

    pub async fn lock_stats(&self) -> LockCacheStats {
        self.locks.stats().await
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(StorageError::Cancelled),
        result = operation => result,
    }
}

/// Builds [`KeyInfo`] from stat headers. Unparseable `last-modified` (RFC
/// 1123) or `content-length` values are errors, never defaults.
pub fn key_info_from_headers(key: &str, headers: &ObjectHeaders) -> Result<KeyInfo> {
    let malformed = |field: &'static str, value: &str, reason: String| {
        StorageError::MalformedMetadata {
            key: key.to_string(),
            field,
            value: value.to_string(),
            reason,
        }
    };

    let modified = headers.get(LAST_MODIFIED).unwrap_or_default();
    let modified = NaiveDateTime::parse_from_str(modified, RFC1123)
        .map_err(|e| malformed(LAST_MODIFIED, modified, e.to_string()))?
        .and_utc();

    let size = headers.get(CONTENT_LENGTH).unwrap_or_default();
    let size = size
        .parse::<u64>()
        .map_err(|e| malformed(CONTENT_LENGTH, size, e.to_string()))?;

    Ok(KeyInfo::new(key, modified, size))
}

#[async_trait]
impl CertStorage for ObjectStoreBackend {
    #[instrument(skip(self, cancel))]
    async fn lock(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let wrap = |source: MutexError| StorageError::Lock {
            name: name.to_string(),
            source,
        };

        let mutex = self
            .locks
            .get_or_create(name, &self.keyspace.map(name))
            .await
            .map_err(wrap)?;

        mutex.acquire(cancel).await.map_err(wrap)
    }

    #[instrument(skip(self, cancel))]
    async fn unlock(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let Some(mutex) = self.locks.get(name).await else {
            warn!(name, "unlock requested for a lock this process never took");
            return Err(StorageError::LockNotCached {
                name: name.to_string(),
            });
        };

        mutex
            .release(cancel)
            .await
            .map_err(|source| StorageError::Lock {
                name: name.to_string(),
                source,
            })
    }

    #[instrument(skip(self, value, cancel), fields(size = value.len()))]
    async fn store(&self, key: &str, value: Bytes, cancel: &CancellationToken) -> Result<()> {
        let k = self.keyspace.map(key);
        debug!(bucket = %self.client.bucket(), key = %k, "store");

        cancellable(cancel, self.client.upload(&k, value)).await
    }

    #[instrument(skip(self, cancel))]
    async fn load(&self, key: &str, cancel: &CancellationToken) -> Result<Bytes> {
        let k = self.keyspace.map(key);
        debug!(bucket = %self.client.bucket(), key = %k, "load");

        cancellable(cancel, async {
            let mut stream = self.client.download(&k).await?;
            let mut buf = BytesMut::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| StorageError::from_store("download", &k, e))?;
                buf.extend_from_slice(&chunk);
            }
            Ok(buf.freeze())
        })
        .await
    }

    #[instrument(skip(self, cancel))]
    async fn delete(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let k = self.keyspace.map(key);
        debug!(bucket = %self.client.bucket(), key = %k, "delete");

        cancellable(cancel, self.client.delete(&k)).await
    }

    #[instrument(skip(self, cancel))]
    async fn exists(&self, key: &str, cancel: &CancellationToken) -> bool {
        let k = self.keyspace.map(key);

        cancellable(cancel, self.client.stat(&k)).await.is_ok()
    }

    #[instrument(skip(self, cancel))]
    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let p = self.keyspace.map(prefix);
        debug!(bucket = %self.client.bucket(), prefix = %p, recursive, "list");

        cancellable(cancel, self.client.list(&p, recursive)).await
    }

    #[instrument(skip(self, cancel))]
    async fn stat(&self, key: &str, cancel: &CancellationToken) -> Result<KeyInfo> {
        let k = self.keyspace.map(key);
        debug!(bucket = %self.client.bucket(), key = %k, "stat");

        let headers = cancellable(cancel, self.client.stat(&k)).await?;
        key_info_from_headers(&k, &headers)
    }
}
