use anyhow::Context;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Tuning for lease-based object locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// How long a lease stays valid without renewal. A crashed holder's lock
    /// becomes available after this long.
    pub lease_ttl: Duration,
    /// How often a held lease is renewed. Must be well below `lease_ttl`.
    pub refresh_interval: Duration,
    /// First delay between acquisition attempts while the lock is contended.
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(20),
            poll_interval: Duration::from_millis(250),
            max_poll_interval: Duration::from_secs(5),
        }
    }
}

impl LockOptions {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut options = Self::default();

        if let Ok(secs) = std::env::var("CERTSTORAGE_LOCK_TTL_SECS") {
            options.lease_ttl = Duration::from_secs(
                secs.parse()
                    .context("CERTSTORAGE_LOCK_TTL_SECS must be a number of seconds")?,
            );
        }
        if let Ok(secs) = std::env::var("CERTSTORAGE_LOCK_REFRESH_SECS") {
            options.refresh_interval = Duration::from_secs(
                secs.parse()
                    .context("CERTSTORAGE_LOCK_REFRESH_SECS must be a number of seconds")?,
            );
        }
        if let Ok(millis) = std::env::var("CERTSTORAGE_LOCK_POLL_MS") {
            options.poll_interval = Duration::from_millis(
                millis
                    .parse()
                    .context("CERTSTORAGE_LOCK_POLL_MS must be a number of milliseconds")?,
            );
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.refresh_interval.is_zero() || self.poll_interval.is_zero() {
            anyhow::bail!("lock refresh and poll intervals must be non-zero");
        }
        if lease_expiry(Utc::now(), self.lease_ttl).is_none() {
            anyhow::bail!("lease ttl ({:?}) is out of range", self.lease_ttl);
        }
        if self.max_poll_interval < self.poll_interval {
            anyhow::bail!(
                "max poll interval ({:?}) must not be shorter than the poll interval ({:?})",
                self.max_poll_interval,
                self.poll_interval
            );
        }
        if self.refresh_interval >= self.lease_ttl {
            anyhow::bail!(
                "lock refresh interval ({:?}) must be shorter than the lease ttl ({:?})",
                self.refresh_interval,
                self.lease_ttl
            );
        }
        Ok(())
    }
}

/// `now + ttl`, or `None` when that is not a representable timestamp.
pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}
