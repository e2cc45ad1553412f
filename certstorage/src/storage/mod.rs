mod backend;
mod client;
mod config;
mod error;
mod keyspace;
mod traits;


pub use backend::{key_info_from_headers, ObjectStoreBackend};
pub use client::{ObjectClient, ObjectHeaders, CONTENT_LENGTH, ETAG, LAST_MODIFIED, RFC1123};
pub use config::StorageConfig;
pub use error::{ErrorKind, Result, StorageError};
pub use keyspace::KeySpace;
pub use traits::CertStorage;
