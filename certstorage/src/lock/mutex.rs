use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::MutexError;
use super::options::{lease_expiry, LockOptions};
use crate::storage::ObjectClient;

/// A named lock shared between processes.
///
/// `acquire` blocks until the lock is owned or `cancel` fires. Acquire is not
/// reentrant: a second acquire through the same handle waits for release.
#[async_trait]
pub trait DistributedMutex: Send + Sync {
    fn name(&self) -> &str;

    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), MutexError>;

    async fn release(&self, cancel: &CancellationToken) -> Result<(), MutexError>;
}

/// Builds mutex handles for fully qualified lock names.
pub trait MutexFactory: Send + Sync {
    fn new_mutex(&self, name: &str) -> Result<Arc<dyn DistributedMutex>, MutexError>;
}

/// Contents of a lock object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn new(holder: impl Into<String>, ttl: Duration) -> Result<Self, MutexError> {
        let now = Utc::now();
        Ok(Self {
            holder: holder.into(),
            acquired_at: now,
            expires_at: expiry(now, ttl)?,
        })
    }

    /// Same lease, valid for another `ttl` from now.
    pub fn renewed(&self, ttl: Duration) -> Result<Self, MutexError> {
        Ok(Self {
            holder: self.holder.clone(),
            acquired_at: self.acquired_at,
            expires_at: expiry(Utc::now(), ttl)?,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn encode(&self) -> Result<Bytes, MutexError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(MutexError::Encode)
    }

    fn decode(name: &str, data: &[u8]) -> Result<Self, MutexError> {
        serde_json::from_slice(data).map_err(|source| MutexError::Decode {
            name: name.to_string(),
            source,
        })
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, MutexError> {
    lease_expiry(now, ttl).ok_or(MutexError::InvalidTtl { ttl })
}

/// Ownership of a lock object as seen by one holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    /// No lock object, or only an expired one.
    Unheld,
    HeldBySelf,
    HeldByOther {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

impl LeaseState {
    pub fn classify(record: Option<&LeaseRecord>, holder: &str, now: DateTime<Utc>) -> Self {
        match record {
            None => Self::Unheld,
            Some(record) if record.is_expired_at(now) => Self::Unheld,
            Some(record) if record.holder == holder => Self::HeldBySelf,
            Some(record) => Self::HeldByOther {
                holder: record.holder.clone(),
                expires_at: record.expires_at,
            },
        }
    }
}

struct Renewal {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Renewal {
    async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "lease renewal task failed");
        }
    }
}

/// Lease-based mutex stored as a single object.
///
/// Acquisition creates the lock object only if it does not exist. An expired
/// lease is replaced with compare-and-swap. Backends without it (the local
/// filesystem) refuse the takeover with [`MutexError::StaleLease`]; the lock
/// object has to be deleted to recover. While held, the lease is renewed in
/// the background every `refresh_interval`.
pub struct ObjectMutex {
    name: String,
    holder: String,
    client: ObjectClient,
    options: LockOptions,
    renewal: Mutex<Option<Renewal>>,
}

impl ObjectMutex {
    pub fn new(
        name: impl Into<String>,
        client: ObjectClient,
        options: LockOptions,
    ) -> Result<Self, MutexError> {
        let name = name.into();
        if name.is_empty() || name.ends_with('/') {
            return Err(MutexError::InvalidName { name });
        }

        Ok(Self {
            name,
            holder: Uuid::new_v4().to_string(),
            client,
            options,
            renewal: Mutex::new(None),
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn state(&self) -> Result<LeaseState, MutexError> {
        let current = read_lease(&self.client, &self.name).await?;
        Ok(LeaseState::classify(
            current.as_ref().map(|(record, _)| record),
            &self.holder,
            Utc::now(),
        ))
    }

    async fn try_acquire(&self) -> Result<bool, MutexError> {
        let lease = LeaseRecord::new(&self.holder, self.options.lease_ttl)?.encode()?;

        match self.client.put_if_absent(&self.name, lease.clone()).await {
            Ok(_) => return Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let Some((current, meta)) = read_lease(&self.client, &self.name).await? else {
            return Ok(false);
        };

        match LeaseState::classify(Some(&current), &self.holder, Utc::now()) {
            LeaseState::Unheld => {
                warn!(
                    name = %self.name,
                    stale_holder = %current.holder,
                    expired_at = %current.expires_at,
                    "taking over expired lease"
                );
                self.take_over(lease, &current, &meta).await
            }
            LeaseState::HeldBySelf => {
                debug!(name = %self.name, "lock held through this handle, waiting");
                Ok(false)
            }
            LeaseState::HeldByOther { holder, expires_at } => {
                debug!(name = %self.name, %holder, %expires_at, "lock held elsewhere, waiting");
                Ok(false)
            }
        }
    }

    async fn take_over(
        &self,
        lease: Bytes,
        stale: &LeaseRecord,
        meta: &ObjectMeta,
    ) -> Result<bool, MutexError> {
        match self.client.put_if_matches(&self.name, lease, meta).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::Precondition { .. } | object_store::Error::NotFound { .. }) => {
                Ok(false)
            }
            Err(object_store::Error::NotImplemented) => Err(MutexError::StaleLease {
                name: self.name.clone(),
                holder: stale.holder.clone(),
                expired_at: stale.expires_at,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn spawn_renewal(&self) -> Renewal {
        let stop = CancellationToken::new();
        let task = tokio::spawn(renew_lease(
            self.client.clone(),
            self.name.clone(),
            self.holder.clone(),
            self.options,
            stop.clone(),
        ));
        Renewal { stop, task }
    }

    async fn start_renewal(&self) {
        let renewal = self.spawn_renewal();
        let previous = self.renewal.lock().await.replace(renewal);
        if let Some(previous) = previous {
            previous.stop().await;
        }
    }

    async fn remove_lease(&self) -> Result<(), MutexError> {
        match read_lease(&self.client, &self.name).await? {
            Some((current, _)) if current.holder == self.holder => {
                match self.client.remove(&self.name).await {
                    Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                info!(name = %self.name, holder = %self.holder, "lock released");
                Ok(())
            }
            Some((current, _)) => Err(MutexError::LeaseLost {
                name: self.name.clone(),
                holder: current.holder,
            }),
            None => {
                warn!(name = %self.name, "lock object vanished before release");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DistributedMutex for ObjectMutex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), MutexError> {
        let mut delay = self.options.poll_interval;

        loop {
            let acquired = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(MutexError::Cancelled),
                acquired = self.try_acquire() => acquired?,
            };

            if acquired {
                self.start_renewal().await;
                info!(name = %self.name, holder = %self.holder, "lock acquired");
                return Ok(());
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(MutexError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.options.max_poll_interval);
        }
    }

    async fn release(&self, cancel: &CancellationToken) -> Result<(), MutexError> {
        if cancel.is_cancelled() {
            return Err(MutexError::Cancelled);
        }

        let mut slot = self.renewal.lock().await;
        let renewal = slot.take().ok_or_else(|| MutexError::NotHeld {
            name: self.name.clone(),
        })?;
        // Renewal must not race the delete, or it could recreate the lease.
        renewal.stop().await;

        let released = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(MutexError::Cancelled),
            released = self.remove_lease() => released,
        };

        if matches!(&released, Err(e) if !matches!(e, MutexError::LeaseLost { .. })) {
            // The lease may still be ours. Keep it alive so the release can
            // be retried.
            *slot = Some(self.spawn_renewal());
        }
        released
    }
}

impl Drop for ObjectMutex {
    fn drop(&mut self) {
        if let Some(renewal) = self.renewal.get_mut().take() {
            renewal.stop.cancel();
        }
    }
}

async fn read_lease(
    client: &ObjectClient,
    name: &str,
) -> Result<Option<(LeaseRecord, ObjectMeta)>, MutexError> {
    match client.get_bytes(name).await {
        Ok((data, meta)) => Ok(Some((LeaseRecord::decode(name, &data)?, meta))),
        Err(object_store::Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn renew_lease(
    client: ObjectClient,
    name: String,
    holder: String,
    options: LockOptions,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => return,
            () = tokio::time::sleep(options.refresh_interval) => {}
        }

        match renew_once(&client, &name, &holder, options.lease_ttl).await {
            Ok(true) => debug!(%name, "lease renewed"),
            Ok(false) => {
                warn!(%name, %holder, "lease lost, stopping renewal");
                return;
            }
            Err(e) => warn!(%name, error = %e, "failed to renew lease"),
        }
    }
}

async fn renew_once(
    client: &ObjectClient,
    name: &str,
    holder: &str,
    ttl: Duration,
) -> Result<bool, MutexError> {
    let Some((current, meta)) = read_lease(client, name).await? else {
        return Ok(false);
    };
    if current.holder != holder {
        return Ok(false);
    }

    let renewed = current.renewed(ttl)?.encode()?;
    match client.put_if_matches(name, renewed.clone(), &meta).await {
        Ok(_) => Ok(true),
        Err(object_store::Error::Precondition { .. } | object_store::Error::NotFound { .. }) => {
            Ok(false)
        }
        Err(object_store::Error::NotImplemented) => {
            // Leases are never taken over without compare-and-swap, so only
            // the holder writes an existing lock object here.
            client.overwrite(name, renewed).await?;
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

/// Creates [`ObjectMutex`] handles in one bucket.
#[derive(Debug, Clone)]
pub struct ObjectMutexFactory {
    client: ObjectClient,
    options: LockOptions,
}

impl ObjectMutexFactory {
    pub fn new(client: ObjectClient, options: LockOptions) -> Self {
        Self { client, options }
    }
}

impl MutexFactory for ObjectMutexFactory {
    fn new_mutex(&self, name: &str) -> Result<Arc<dyn DistributedMutex>, MutexError> {
        Ok(Arc::new(ObjectMutex::new(
            name,
            self.client.clone(),
            self.options,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::local::LocalFileSystem;
    use object_store::memory::InMemory;
    use object_store::ObjectStore;
    use tempfile::TempDir;

    fn fast_options() -> LockOptions {
        LockOptions {
            lease_ttl: Duration::from_secs(2),
            refresh_interval: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            max_poll_interval: Duration::from_millis(50),
        }
    }

    fn shared_client() -> ObjectClient {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        ObjectClient::from_store(store, "locks")
    }

    #[test]
    fn test_classify_lease_states() {
        let now = Utc::now();
        let live = LeaseRecord::new("me", Duration::from_secs(30)).unwrap();
        let mut expired = LeaseRecord::new("other", Duration::from_secs(30)).unwrap();
        expired.expires_at = now - chrono::Duration::seconds(1);

        assert_eq!(LeaseState::classify(None, "me", now), LeaseState::Unheld);
        assert_eq!(
            LeaseState::classify(Some(&live), "me", now),
            LeaseState::HeldBySelf
        );
        assert!(matches!(
            LeaseState::classify(Some(&live), "someone-else", now),
            LeaseState::HeldByOther { ref holder, .. } if holder == "me"
        ));
        assert_eq!(
            LeaseState::classify(Some(&expired), "me", now),
            LeaseState::Unheld
        );
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let client = shared_client();
        assert!(matches!(
            ObjectMutex::new("", client.clone(), fast_options()),
            Err(MutexError::InvalidName { .. })
        ));
        assert!(matches!(
            ObjectMutex::new("certs/", client, fast_options()),
            Err(MutexError::InvalidName { .. })
        ));
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let client = shared_client();
        let mutex = ObjectMutex::new("certs/issue_example.com", client.clone(), fast_options())
            .unwrap();
        let cancel = CancellationToken::new();

        mutex.acquire(&cancel).await.unwrap();
        assert_eq!(mutex.state().await.unwrap(), LeaseState::HeldBySelf);

        mutex.release(&cancel).await.unwrap();
        assert_eq!(mutex.state().await.unwrap(), LeaseState::Unheld);
        assert!(client.head("certs/issue_example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_release_without_acquire_fails() {
        let mutex = ObjectMutex::new("never-locked", shared_client(), fast_options()).unwrap();
        let err = mutex.release(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, MutexError::NotHeld { .. }));
    }

    #[tokio::test]
    async fn test_second_holder_waits_for_release() {
        let client = shared_client();
        let first = Arc::new(ObjectMutex::new("cert", client.clone(), fast_options()).unwrap());
        let second = Arc::new(ObjectMutex::new("cert", client, fast_options()).unwrap());
        let cancel = CancellationToken::new();

        first.acquire(&cancel).await.unwrap();

        let waiter = {
            let second = second.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { second.acquire(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished(), "second holder acquired a held lock");

        first.release(&cancel).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(second.state().await.unwrap(), LeaseState::HeldBySelf);
        second.release(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let client = shared_client();
        let mut stale = LeaseRecord::new("crashed-holder", Duration::from_secs(30)).unwrap();
        stale.expires_at = Utc::now() - chrono::Duration::seconds(5);
        client
            .overwrite("cert", stale.encode().unwrap())
            .await
            .unwrap();

        let mutex = ObjectMutex::new("cert", client, fast_options()).unwrap();
        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(5), mutex.acquire(&cancel))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(mutex.state().await.unwrap(), LeaseState::HeldBySelf);
    }

    #[tokio::test]
    async fn test_acquire_is_cancellable() {
        let client = shared_client();
        let holder = ObjectMutex::new("cert", client.clone(), fast_options()).unwrap();
        let contender = ObjectMutex::new("cert", client, fast_options()).unwrap();
        holder.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), contender.acquire(&cancel))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, MutexError::Cancelled));
    }

    #[tokio::test]
    async fn test_release_after_lease_lost() {
        let client = shared_client();
        let mutex = ObjectMutex::new("cert", client.clone(), fast_options()).unwrap();
        let cancel = CancellationToken::new();
        mutex.acquire(&cancel).await.unwrap();

        let thief = LeaseRecord::new("other-gateway", Duration::from_secs(30)).unwrap();
        client
            .overwrite("cert", thief.encode().unwrap())
            .await
            .unwrap();

        let err = mutex.release(&cancel).await.unwrap_err();
        assert!(matches!(err, MutexError::LeaseLost { ref holder, .. } if holder == "other-gateway"));
    }

    #[tokio::test]
    async fn test_lease_is_renewed_while_held() {
        let options = LockOptions {
            lease_ttl: Duration::from_millis(600),
            refresh_interval: Duration::from_millis(100),
            ..fast_options()
        };
        let client = shared_client();
        let mutex = ObjectMutex::new("cert", client, options).unwrap();
        let cancel = CancellationToken::new();
        mutex.acquire(&cancel).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(mutex.state().await.unwrap(), LeaseState::HeldBySelf);

        mutex.release(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_release_can_be_retried() {
        let mutex = ObjectMutex::new("cert", shared_client(), fast_options()).unwrap();
        let cancel = CancellationToken::new();
        mutex.acquire(&cancel).await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = mutex.release(&cancelled).await.unwrap_err();
        assert!(matches!(err, MutexError::Cancelled));
        assert_eq!(mutex.state().await.unwrap(), LeaseState::HeldBySelf);

        mutex.release(&cancel).await.unwrap();
        assert_eq!(mutex.state().await.unwrap(), LeaseState::Unheld);

        // Well under the lease ttl: the lock object is really gone.
        tokio::time::timeout(Duration::from_millis(500), mutex.acquire(&cancel))
            .await
            .unwrap()
            .unwrap();
        mutex.release(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lease_is_not_taken_over_without_compare_and_swap() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn ObjectStore> =
            Arc::new(LocalFileSystem::new_with_prefix(dir.path()).unwrap());
        let client = ObjectClient::from_store(store, "locks");

        let mut stale = LeaseRecord::new("crashed-holder", Duration::from_secs(30)).unwrap();
        stale.expires_at = Utc::now() - chrono::Duration::seconds(5);
        client
            .overwrite("cert", stale.encode().unwrap())
            .await
            .unwrap();

        let first = ObjectMutex::new("cert", client.clone(), fast_options()).unwrap();
        let second = ObjectMutex::new("cert", client.clone(), fast_options()).unwrap();
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(first.acquire(&cancel), second.acquire(&cancel));
        for result in [a, b] {
            assert!(matches!(
                result,
                Err(MutexError::StaleLease { ref holder, .. }) if holder == "crashed-holder"
            ));
        }
        let (data, _) = client.get_bytes("cert").await.unwrap();
        assert_eq!(LeaseRecord::decode("cert", &data).unwrap(), stale);

        // Deleting the lock object is how a crashed holder is cleared here.
        client.remove("cert").await.unwrap();
        first.acquire(&cancel).await.unwrap();
        assert!(matches!(
            second.state().await.unwrap(),
            LeaseState::HeldByOther { ref holder, .. } if holder == first.holder()
        ));
        first.release(&cancel).await.unwrap();
    }
}
