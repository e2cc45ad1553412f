use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MutexError {
    #[error("invalid mutex name {name:?}")]
    InvalidName { name: String },

    #[error("lock backend: {0}")]
    Backend(#[from] object_store::Error),

    #[error("encode lease: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decode lease {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("mutex {name} is not held")]
    NotHeld { name: String },

    #[error("lease on {name} lost to {holder}")]
    LeaseLost { name: String, holder: String },

    /// The backend has no compare-and-swap, so an expired lease cannot be
    /// replaced without racing other contenders. Deleting the lock object
    /// releases it.
    #[error("lease on {name} held by {holder} expired at {expired_at} and cannot be taken over on this backend")]
    StaleLease {
        name: String,
        holder: String,
        expired_at: DateTime<Utc>,
    },

    #[error("lease ttl {ttl:?} is out of range")]
    InvalidTtl { ttl: Duration },

    #[error("cancelled")]
    Cancelled,
}
