use bytes::Bytes;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutPayload, PutResult, UpdateVersion};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::config::StorageConfig;
use super::error::{Result, StorageError};

pub const LAST_MODIFIED: &str = "last-modified";
pub const CONTENT_LENGTH: &str = "content-length";
pub const ETAG: &str = "etag";

/// RFC 1123 date format, as used by HTTP `Last-Modified` headers.
pub const RFC1123: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Header-like object metadata returned by [`ObjectClient::stat`].
///
/// Names are case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectHeaders(BTreeMap<String, String>);

impl ObjectHeaders {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }
}

impl From<&ObjectMeta> for ObjectHeaders {
    fn from(meta: &ObjectMeta) -> Self {
        let mut headers = Self::default();
        headers.insert(LAST_MODIFIED, meta.last_modified.format(RFC1123).to_string());
        headers.insert(CONTENT_LENGTH, meta.size.to_string());
        if let Some(e_tag) = &meta.e_tag {
            headers.insert(ETAG, e_tag.clone());
        }
        headers
    }
}

/// Thin client over a single bucket of an [`ObjectStore`].
///
/// Keys are plain strings with `/` separated segments and are stored
/// verbatim, so a key reads back from [`ObjectClient::list`] exactly as it
/// was written. Keys with empty segments (`a//b`), `.` or `..` segments, or
/// ASCII control characters are rejected as backend errors. A missing object
/// is always reported as [`StorageError::NotFound`].
#[derive(Clone)]
pub struct ObjectClient {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl fmt::Debug for ObjectClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectClient")
            .field("store", &self.store.to_string())
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl ObjectClient {
    pub fn connect(config: &StorageConfig, bucket: &str) -> object_store::Result<Self> {
        let store: Arc<dyn ObjectStore> = match config {
            StorageConfig::Local { path } => {
                let root = path.join(bucket);
                info!("Initializing local storage at: {:?}", root);
                Arc::new(LocalFileSystem::new_with_prefix(root)?)
            }
            StorageConfig::S3 {
                region,
                endpoint,
                access_key_id,
                secret_access_key,
                allow_http,
            } => {
                info!("Initializing S3 storage for bucket: {}", bucket);
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_allow_http(*allow_http)
                    .with_conditional_put(S3ConditionalPut::ETagMatch);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(access_key_id) = access_key_id {
                    builder = builder.with_access_key_id(access_key_id);
                }
                if let Some(secret_access_key) = secret_access_key {
                    builder = builder.with_secret_access_key(secret_access_key);
                }
                Arc::new(builder.build()?)
            }
        };

        Ok(Self::from_store(store, bucket))
    }

    pub fn from_store(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Writes `data` at `key`, replacing any existing object.
    pub async fn upload(&self, key: &str, data: Bytes) -> Result<()> {
        self.overwrite(key, data)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::from_store("upload", key, e))
    }

    pub async fn download(&self, key: &str) -> Result<BoxStream<'static, object_store::Result<Bytes>>> {
        let path = location(key).map_err(|e| StorageError::from_store("download", key, e))?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| StorageError::from_store("download", key, e))?;
        Ok(result.into_stream())
    }

    /// Deletes `key`. Some backends delete missing objects silently, so the
    /// object is probed first to report a missing key consistently.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.head(key)
            .await
            .map_err(|e| StorageError::from_store("delete", key, e))?;
        self.remove(key)
            .await
            .map_err(|e| StorageError::from_store("delete", key, e))
    }

    /// Lists keys below `prefix`.
    ///
    /// Non-recursive listings return direct child objects plus direct child
    /// "directories" with a trailing `/`.
    pub async fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>> {
        let path = location(prefix).map_err(|e| StorageError::from_store("list", prefix, e))?;
        let prefix_path = (!path.as_ref().is_empty()).then_some(&path);

        let listed = if recursive {
            self.store
                .list(prefix_path)
                .map_ok(|meta| meta.location.to_string())
                .try_collect::<Vec<_>>()
                .await
        } else {
            self.store.list_with_delimiter(prefix_path).await.map(|listing| {
                let mut keys: Vec<String> = listing
                    .objects
                    .into_iter()
                    .map(|meta| meta.location.to_string())
                    .collect();
                keys.extend(
                    listing
                        .common_prefixes
                        .into_iter()
                        .map(|dir| format!("{dir}/")),
                );
                keys
            })
        };

        match listed {
            Ok(keys) => Ok(keys),
            // A prefix with nothing under it is an empty listing.
            Err(object_store::Error::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(StorageError::from_store("list", prefix, e)),
        }
    }

    pub async fn stat(&self, key: &str) -> Result<ObjectHeaders> {
        let meta = self
            .head(key)
            .await
            .map_err(|e| StorageError::from_store("stat", key, e))?;
        Ok(ObjectHeaders::from(&meta))
    }

    /// Runs a write/stat/list/delete cycle with a throwaway object under
    /// `prefix`, so missing permissions surface at startup.
    pub async fn test_permissions(&self, prefix: &str) -> Result<()> {
        let probe = format!("{prefix}.certstorage-probe-{}", Uuid::new_v4());
        debug!(bucket = %self.bucket, key = %probe, "probing bucket permissions");

        self.upload(&probe, Bytes::from_static(b"permission probe"))
            .await?;
        let checked = async {
            self.stat(&probe).await?;
            self.list(prefix, false).await.map(|_| ())
        }
        .await;
        let deleted = self.delete(&probe).await;

        checked.and(deleted)
    }

    pub(crate) async fn head(&self, key: &str) -> object_store::Result<ObjectMeta> {
        self.store.head(&location(key)?).await
    }

    pub(crate) async fn get_bytes(&self, key: &str) -> object_store::Result<(Bytes, ObjectMeta)> {
        let result = self.store.get(&location(key)?).await?;
        let meta = result.meta.clone();
        let bytes = result.bytes().await?;
        Ok((bytes, meta))
    }

    pub(crate) async fn put_if_absent(&self, key: &str, data: Bytes) -> object_store::Result<PutResult> {
        self.store
            .put_opts(&location(key)?, PutPayload::from(data), PutMode::Create.into())
            .await
    }

    pub(crate) async fn put_if_matches(
        &self,
        key: &str,
        data: Bytes,
        meta: &ObjectMeta,
    ) -> object_store::Result<PutResult> {
        let version = UpdateVersion {
            e_tag: meta.e_tag.clone(),
            version: meta.version.clone(),
        };
        self.store
            .put_opts(
                &location(key)?,
                PutPayload::from(data),
                PutMode::Update(version).into(),
            )
            .await
    }

    pub(crate) async fn overwrite(&self, key: &str, data: Bytes) -> object_store::Result<PutResult> {
        self.store.put(&location(key)?, PutPayload::from(data)).await
    }

    pub(crate) async fn remove(&self, key: &str) -> object_store::Result<()> {
        self.store.delete(&location(key)?).await
    }
}

fn location(key: &str) -> object_store::Result<Path> {
    Ok(Path::parse(key)?)
}
