//! Weight limited cache with cookie-based insertion.
//!
//! `begin_insert` hands exactly one caller an [`InsertCookie`]; that caller
//! must populate or cancel it. Everyone else racing on the same key gets a
//! future for the in-flight insertion. This guarantees at most one concurrent
//! load per key.
//!
//! Eviction is LRU by weight. Evicted entries are handed back to the caller
//! completing the insertion, so domain-side cleanup (deleting files, fixing
//! counters) happens outside the cache lock.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};

use crate::lru_cache::LruCache;
use crate::shared_promise::SharedPromise;

/// Weight of a cache value. Evaluated under the cache lock, keep it cheap.
pub trait Weighted {
    fn weight(&self) -> u64;
}

impl<T: Weighted + ?Sized> Weighted for Arc<T> {
    fn weight(&self) -> u64 {
        (**self).weight()
    }
}

struct CacheState<K, V> {
    ready: LruCache<K, V>,
    pending: HashMap<K, SharedPromise<V>>,
    total_weight: u64,
}

struct CacheInner<K, V> {
    state: Mutex<CacheState<K, V>>,
    weight_limit: u64,
    max_entries: usize,
}

pub struct WeightCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for WeightCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Outcome of [`WeightCache::begin_insert`].
pub enum BeginInsert<K, V>
where
    K: std::cmp::Eq + std::hash::Hash + Copy,
    V: Clone + Weighted,
{
    /// This caller won and must complete or cancel the cookie.
    Inserted(InsertCookie<K, V>),
    /// The value is already cached.
    Cached(V),
    /// Another caller is loading the value; await the future.
    Pending(Pin<Box<dyn Future<Output = Result<V, Error>> + Send>>),
}

impl<K, V> WeightCache<K, V>
where
    K: std::cmp::Eq + std::hash::Hash + Copy + Send + 'static,
    V: Clone + Weighted + Send + 'static,
{
    pub fn new(weight_limit: u64, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    ready: LruCache::new(),
                    pending: HashMap::new(),
                    total_weight: 0,
                }),
                weight_limit,
                max_entries: max_entries.max(1),
            }),
        }
    }

    pub fn begin_insert(&self, key: K) -> BeginInsert<K, V> {
        let mut state = self.inner.state.lock().unwrap();

        if let Some(value) = state.ready.get(&key) {
            return BeginInsert::Cached(value.clone());
        }

        if let Some(promise) = state.pending.get(&key) {
            return BeginInsert::Pending(Box::pin(promise.listen()));
        }

        let promise = SharedPromise::new();
        state.pending.insert(key, promise.clone());
        BeginInsert::Inserted(InsertCookie {
            inner: Arc::clone(&self.inner),
            key,
            promise,
            done: false,
        })
    }

    /// Ready-value lookup; never waits on pending insertions.
    pub fn find(&self, key: &K) -> Option<V> {
        let mut state = self.inner.state.lock().unwrap();
        state.ready.get(key).cloned()
    }

    /// Remove a ready value from the cache, returning it.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.inner.state.lock().unwrap();
        let value = state.ready.remove(key)?;
        state.total_weight -= value.weight();
        Some(value)
    }

    /// Snapshot of all ready values, most recently used first.
    pub fn get_all(&self) -> Vec<V> {
        let state = self.inner.state.lock().unwrap();
        state.ready.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_weight(&self) -> u64 {
        self.inner.state.lock().unwrap().total_weight
    }
}

pub struct InsertCookie<K, V>
where
    K: std::cmp::Eq + std::hash::Hash + Copy,
    V: Clone + Weighted,
{
    inner: Arc<CacheInner<K, V>>,
    key: K,
    promise: SharedPromise<V>,
    done: bool,
}

impl<K, V> InsertCookie<K, V>
where
    K: std::cmp::Eq + std::hash::Hash + Copy,
    V: Clone + Weighted,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Insert the value, resolve all waiters and return whatever had to be
    /// evicted to get back under the weight and entry bounds. The entry just
    /// inserted is never evicted by its own insertion.
    pub fn complete(mut self, value: V) -> Vec<(K, V)> {
        self.done = true;

        let evicted = {
            let mut state = self.inner.state.lock().unwrap();
            state.pending.remove(&self.key);
            state.total_weight += value.weight();
            if let Some(old) = state.ready.insert(self.key, value.clone()) {
                state.total_weight -= old.weight();
            }

            let mut evicted = Vec::new();
            while state.ready.len() > 1
                && (state.total_weight > self.inner.weight_limit
                    || state.ready.len() > self.inner.max_entries)
            {
                match state.ready.pop_lru() {
                    Some((key, old)) => {
                        state.total_weight -= old.weight();
                        evicted.push((key, old));
                    }
                    None => break,
                }
            }
            evicted
        };

        self.promise.set(Ok(value));
        evicted
    }

    /// Resolve all waiters with the value but do not keep it in the cache.
    pub fn complete_uncached(mut self, value: V) {
        self.done = true;
        self.inner.state.lock().unwrap().pending.remove(&self.key);
        self.promise.set(Ok(value));
    }

    /// Fail the insertion; waiters get the error, the slot is released.
    pub fn cancel(mut self, err: Error) {
        self.done = true;
        self.inner.state.lock().unwrap().pending.remove(&self.key);
        self.promise.set(Err(err));
    }
}

impl<K, V> Drop for InsertCookie<K, V>
where
    K: std::cmp::Eq + std::hash::Hash + Copy,
    V: Clone + Weighted,
{
    fn drop(&mut self) {
        if !self.done {
            self.inner.state.lock().unwrap().pending.remove(&self.key);
            self.promise
                .set(Err(format_err!("cache insertion abandoned")));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Blob(Vec<u8>);

    impl Weighted for Blob {
        fn weight(&self) -> u64 {
            self.0.len() as u64
        }
    }

    #[tokio::test]
    async fn test_single_loader_per_key() {
        let cache: WeightCache<u32, Blob> = WeightCache::new(1024, 16);

        let cookie = match cache.begin_insert(1) {
            BeginInsert::Inserted(cookie) => cookie,
            _ => panic!("expected to win the insertion"),
        };

        // second caller must not win
        let pending = match cache.begin_insert(1) {
            BeginInsert::Pending(fut) => fut,
            _ => panic!("expected a pending insertion"),
        };

        let evicted = cookie.complete(Blob(vec![0; 10]));
        assert!(evicted.is_empty());

        assert_eq!(pending.await.unwrap(), Blob(vec![0; 10]));
        match cache.begin_insert(1) {
            BeginInsert::Cached(value) => assert_eq!(value.weight(), 10),
            _ => panic!("expected a cache hit"),
        }
        assert_eq!(cache.total_weight(), 10);
    }

    #[tokio::test]
    async fn test_cancel_fails_waiters() {
        let cache: WeightCache<u32, Blob> = WeightCache::new(1024, 16);

        let cookie = match cache.begin_insert(1) {
            BeginInsert::Inserted(cookie) => cookie,
            _ => panic!(),
        };
        let pending = match cache.begin_insert(1) {
            BeginInsert::Pending(fut) => fut,
            _ => panic!(),
        };

        cookie.cancel(format_err!("load failed"));
        assert!(pending.await.is_err());

        // the key is insertable again
        assert!(matches!(cache.begin_insert(1), BeginInsert::Inserted(_)));
    }

    #[tokio::test]
    async fn test_weight_eviction() {
        let cache: WeightCache<u32, Blob> = WeightCache::new(100, 16);

        for key in 0..4u32 {
            match cache.begin_insert(key) {
                BeginInsert::Inserted(cookie) => {
                    cookie.complete(Blob(vec![0; 30]));
                }
                _ => panic!(),
            }
        }
        // 4 * 30 > 100: the oldest entry must have been evicted
        assert_eq!(cache.len(), 3);
        assert!(cache.total_weight() <= 100);
        assert!(cache.find(&0).is_none());
        assert!(cache.find(&3).is_some());
    }

    #[tokio::test]
    async fn test_oversized_entry_survives_its_own_insertion() {
        let cache: WeightCache<u32, Blob> = WeightCache::new(10, 16);
        match cache.begin_insert(1) {
            BeginInsert::Inserted(cookie) => {
                let evicted = cookie.complete(Blob(vec![0; 50]));
                assert!(evicted.is_empty());
            }
            _ => panic!(),
        }
        assert!(cache.find(&1).is_some());
    }

    #[tokio::test]
    async fn test_uncached_completion() {
        let cache: WeightCache<u32, Blob> = WeightCache::new(1024, 16);
        let cookie = match cache.begin_insert(1) {
            BeginInsert::Inserted(cookie) => cookie,
            _ => panic!(),
        };
        let pending = match cache.begin_insert(1) {
            BeginInsert::Pending(fut) => fut,
            _ => panic!(),
        };

        cookie.complete_uncached(Blob(vec![1, 2, 3]));
        assert_eq!(pending.await.unwrap(), Blob(vec![1, 2, 3]));
        assert!(cache.find(&1).is_none());
        assert_eq!(cache.total_weight(), 0);
    }

    #[tokio::test]
    async fn test_dropped_cookie_releases_slot() {
        let cache: WeightCache<u32, Blob> = WeightCache::new(1024, 16);
        let pending = {
            let _cookie = match cache.begin_insert(1) {
                BeginInsert::Inserted(cookie) => cookie,
                _ => panic!(),
            };
            match cache.begin_insert(1) {
                BeginInsert::Pending(fut) => fut,
                _ => panic!(),
            }
            // cookie dropped without completion
        };
        assert!(pending.await.is_err());
        assert!(matches!(cache.begin_insert(1), BeginInsert::Inserted(_)));
    }
}
