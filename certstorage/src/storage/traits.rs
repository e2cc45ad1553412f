use async_trait::async_trait;
use bytes::Bytes;
use shared_types::KeyInfo;
use tokio_util::sync::CancellationToken;

use super::error::Result;

/// Persistence and locking contract used by the certificate manager.
///
/// Keys and lock names are logical; implementations namespace them. Every
/// call aborts with [`super::StorageError::Cancelled`] once `cancel` fires.
#[async_trait]
pub trait CertStorage: Send + Sync {
    /// Blocks until the named lock is held by this process.
    async fn lock(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    async fn unlock(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    async fn store(&self, key: &str, value: Bytes, cancel: &CancellationToken) -> Result<()>;

    async fn load(&self, key: &str, cancel: &CancellationToken) -> Result<Bytes>;

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> Result<()>;

    /// Any failure, including cancellation, reads as `false`.
    async fn exists(&self, key: &str, cancel: &CancellationToken) -> bool;

    async fn list(
        &self,
        prefix: &str,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>>;

    async fn stat(&self, key: &str, cancel: &CancellationToken) -> Result<KeyInfo>;
}
