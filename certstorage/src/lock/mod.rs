mod cache;
mod error;
mod mutex;
mod options;

pub use cache::{LockCache, LockCacheStats};
pub use error::MutexError;
pub use mutex::{
    DistributedMutex, LeaseRecord, LeaseState, MutexFactory, ObjectMutex, ObjectMutexFactory,
};
pub use options::LockOptions;
