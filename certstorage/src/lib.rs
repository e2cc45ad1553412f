//! Certificate storage on top of an object store, with distributed locks
//! synthesized from conditional object writes.

pub mod lock;
pub mod storage;

pub use lock::{DistributedMutex, LockOptions, MutexError, MutexFactory};
pub use shared_types::KeyInfo;
pub use storage::{CertStorage, ErrorKind, ObjectStoreBackend, StorageConfig, StorageError};
