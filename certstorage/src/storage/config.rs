use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Credentials and location of the backing object store.
///
/// The bucket itself is not part of the config; it comes from the
/// `bucket[/prefix]` path the storage is opened with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StorageConfig {
    /// Buckets are directories under `path`.
    Local { path: PathBuf },
    S3 {
        region: Option<String>,
        endpoint: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        allow_http: bool,
    },
}

impl StorageConfig {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local { path: path.into() }
    }

    pub fn s3(
        region: Option<String>,
        endpoint: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        allow_http: bool,
    ) -> Self {
        Self::S3 {
            region,
            endpoint,
            access_key_id,
            secret_access_key,
            allow_http,
        }
    }

    /// Reads `STORAGE_BACKEND` (`local` or `s3`) and the backend's settings.
    ///
    /// For `local`, `STORAGE_PATH` is the root directory that holds buckets:
    /// opening `certs/gateway` uses `$STORAGE_PATH/certs` as the bucket and
    /// `gateway/` as the key prefix inside it. For `s3`, the bucket is the
    /// first segment of that path and the `AWS_*` variables select the
    /// endpoint and credentials.
    pub fn from_env() -> anyhow::Result<Self> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "local".to_string());

        match backend.as_str() {
            "local" => {
                let path = std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data".to_string());
                Ok(Self::local(path))
            }
            "s3" => {
                let region = std::env::var("AWS_REGION").ok();
                let endpoint = std::env::var("AWS_ENDPOINT").ok();
                let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok();
                let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok();
                let allow_http = std::env::var("AWS_ALLOW_HTTP")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse::<bool>()
                    .unwrap_or(false);

                Ok(Self::s3(
                    region,
                    endpoint,
                    access_key_id,
                    secret_access_key,
                    allow_http,
                ))
            }
            _ => anyhow::bail!(
                "Unknown storage backend: {}. Must be 'local' or 's3'",
                backend
            ),
        }
    }
}
