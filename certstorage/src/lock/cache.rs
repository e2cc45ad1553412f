use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::error::MutexError;
use super::mutex::{DistributedMutex, MutexFactory};

/// Snapshot of lock cache activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Process-local map from lock name to its mutex handle.
///
/// At most one handle exists per name. Entries are never evicted, so memory
/// grows with the number of distinct names ever locked. The map is only
/// locked for lookup-or-insert, never while a handle talks to the backend.
pub struct LockCache {
    factory: Arc<dyn MutexFactory>,
    handles: Mutex<HashMap<String, Arc<dyn DistributedMutex>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LockCache {
    pub fn new(factory: Arc<dyn MutexFactory>) -> Self {
        Self {
            factory,
            handles: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the handle cached for `name`, creating it for `qualified_name`
    /// on first use. A failed creation leaves no entry behind.
    pub async fn get_or_create(
        &self,
        name: &str,
        qualified_name: &str,
    ) -> Result<Arc<dyn DistributedMutex>, MutexError> {
        let mut handles = self.handles.lock().await;
        let (handle, hit) = match handles.get(name) {
            Some(handle) => (handle.clone(), true),
            None => {
                let handle = self.factory.new_mutex(qualified_name)?;
                handles.insert(name.to_string(), handle.clone());
                (handle, false)
            }
        };
        drop(handles);

        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        debug!(name, hit, "lock cache lookup");

        Ok(handle)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn DistributedMutex>> {
        self.handles.lock().await.get(name).cloned()
    }

    pub async fn stats(&self) -> LockCacheStats {
        LockCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.handles.lock().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio_util::sync::CancellationToken;

    struct NoopMutex(String);

    #[async_trait]
    impl DistributedMutex for NoopMutex {
        fn name(&self) -> &str {
            &self.0
        }

        async fn acquire(&self, _cancel: &CancellationToken) -> Result<(), MutexError> {
            Ok(())
        }

        async fn release(&self, _cancel: &CancellationToken) -> Result<(), MutexError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicUsize,
    }

    impl MutexFactory for CountingFactory {
        fn new_mutex(&self, name: &str) -> Result<Arc<dyn DistributedMutex>, MutexError> {
            if name.ends_with('/') {
                return Err(MutexError::InvalidName {
                    name: name.to_string(),
                });
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopMutex(name.to_string())))
        }
    }

    #[tokio::test]
    async fn test_first_lookup_misses_then_hits() {
        let factory = Arc::new(CountingFactory::default());
        let cache = LockCache::new(factory.clone());

        let first = cache.get_or_create("a", "p/a").await.unwrap();
        let second = cache.get_or_create("a", "p/a").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "p/a");
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.stats().await,
            LockCacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
    }

    #[tokio::test]
    async fn test_failed_creation_leaves_no_entry() {
        let cache = LockCache::new(Arc::new(CountingFactory::default()));

        assert!(cache.get_or_create("", "p/").await.is_err());
        assert!(cache.get("").await.is_none());
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_share_one_handle() {
        let factory = Arc::new(CountingFactory::default());
        let cache = Arc::new(LockCache::new(factory.clone()));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_or_create("same", "same").await })
            })
            .collect();
        let handles: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses, stats.entries), (15, 1, 1));
    }
}
