//! Bounded single-flight cache.
//!
//! Concurrent lookups of the same canonical key share one load: the first
//! caller spawns the load as a detached task and every caller waits on its
//! broadcast result, so a caller abandoning its wait never cancels the load
//! for the others. Successful values are cached with exact least-recently-
//! used eviction at `max_entries`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use kestrel_common::KestrelError;
use parking_lot::Mutex;
use tokio::sync::watch;

/// Canonical cache key forms.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum CacheKey {
    Text(String),
    Int(i64),
    Bytes(Vec<u8>),
}

/// Default canonicalization for key types with an obvious canonical form.
pub trait IntoCacheKey {
    fn cache_key(&self) -> CacheKey;
}

impl IntoCacheKey for String {
    fn cache_key(&self) -> CacheKey {
        CacheKey::Text(self.clone())
    }
}

impl IntoCacheKey for i64 {
    fn cache_key(&self) -> CacheKey {
        CacheKey::Int(*self)
    }
}

impl IntoCacheKey for Vec<String> {
    fn cache_key(&self) -> CacheKey {
        CacheKey::Text(self.join("\u{0}"))
    }
}

pub type SharedResult<V> = Result<V, Arc<KestrelError>>;
pub type LoadFuture<V> = Pin<Box<dyn Future<Output = Result<V, KestrelError>> + Send>>;
pub type LoadFn<K, V> = Arc<dyn Fn(K) -> LoadFuture<V> + Send + Sync>;
pub type Marshaller<K> = Arc<dyn Fn(&K) -> CacheKey + Send + Sync>;

struct Entry<V> {
    value: V,
    last_access: u64,
}

struct CacheState<V> {
    entries: HashMap<CacheKey, Entry<V>>,
    in_flight: HashMap<CacheKey, watch::Receiver<Option<SharedResult<V>>>>,
    access_seq: u64,
}

pub struct SingleFlightCache<K, V> {
    max_entries: usize,
    load: LoadFn<K, V>,
    marshaller: Option<Marshaller<K>>,
    state: Arc<Mutex<CacheState<V>>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: IntoCacheKey + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// A cache holding at most `max_entries` values (0 = unbounded),
    /// loading misses through `load`.
    pub fn new(max_entries: usize, load: LoadFn<K, V>) -> SingleFlightCache<K, V> {
        SingleFlightCache {
            max_entries,
            load,
            marshaller: None,
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                access_seq: 0,
            })),
        }
    }

    /// Replace the default canonicalization. Distinct keys that marshal to
    /// the same form share one cached value.
    pub fn with_marshaller(mut self, marshaller: Marshaller<K>) -> SingleFlightCache<K, V> {
        self.marshaller = Some(marshaller);
        self
    }

    fn canonical(&self, key: &K) -> CacheKey {
        match &self.marshaller {
            Some(m) => m(key),
            None => key.cache_key(),
        }
    }

    /// Look up `key`, loading it if absent. Every concurrent caller for the
    /// same canonical key observes the same result.
    pub async fn get(&self, key: K) -> SharedResult<V> {
        self.get_with_deadline(key, None).await
    }

    /// Like [`get`](Self::get), but abandon the wait at `deadline`. The
    /// shared load keeps running for other callers.
    pub async fn get_with_deadline(&self, key: K, deadline: Option<Instant>) -> SharedResult<V> {
        let canonical = self.canonical(&key);
        let mut rx = {
            let mut st = self.state.lock();
            st.access_seq += 1;
            let seq = st.access_seq;
            if let Some(entry) = st.entries.get_mut(&canonical) {
                entry.last_access = seq;
                return Ok(entry.value.clone());
            }
            match st.in_flight.get(&canonical) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    st.in_flight.insert(canonical.clone(), rx.clone());
                    self.spawn_load(key, canonical, tx);
                    rx
                }
            }
        };

        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            let changed = rx.changed();
            let waited = match deadline {
                Some(d) => match tokio::time::timeout_at(d.into(), changed).await {
                    Ok(r) => r,
                    Err(_) => return Err(Arc::new(KestrelError::DeadlineExceeded)),
                },
                None => changed.await,
            };
            if waited.is_err() {
                return Err(Arc::new(KestrelError::Canceled(
                    "shared load abandoned".into(),
                )));
            }
        }
    }

    fn spawn_load(&self, key: K, canonical: CacheKey, tx: watch::Sender<Option<SharedResult<V>>>) {
        let load = Arc::clone(&self.load);
        let state = Arc::clone(&self.state);
        let max_entries = self.max_entries;
        tokio::spawn(async move {
            let result = load(key).await.map_err(Arc::new);
            {
                let mut st = state.lock();
                st.in_flight.remove(&canonical);
                if let Ok(value) = &result {
                    st.access_seq += 1;
                    let seq = st.access_seq;
                    st.entries
                        .insert(canonical, Entry { value: value.clone(), last_access: seq });
                    if max_entries > 0 && st.entries.len() > max_entries {
                        if let Some(lru) = st
                            .entries
                            .iter()
                            .min_by_key(|(_, e)| e.last_access)
                            .map(|(k, _)| k.clone())
                        {
                            st.entries.remove(&lru);
                        }
                    }
                }
            }
            let _ = tx.send(Some(result));
        });
    }

    /// Whether a value is cached for this key.
    pub fn contains(&self, key: &K) -> bool {
        let canonical = self.canonical(key);
        self.state.lock().entries.contains_key(&canonical)
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn identity_cache(max: usize, loads: Arc<AtomicU32>) -> SingleFlightCache<i64, i64> {
        SingleFlightCache::new(
            max,
            Arc::new(move |key: i64| {
                let loads = Arc::clone(&loads);
                Box::pin(async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(key)
                }) as LoadFuture<i64>
            }),
        )
    }

    #[tokio::test]
    async fn test_get_loads_and_caches() {
        let loads = Arc::new(AtomicU32::new(0));
        let cache = identity_cache(100, Arc::clone(&loads));
        for i in 0..50 {
            assert_eq!(cache.get(i).await.unwrap(), i);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 50);
        for i in 0..50 {
            assert_eq!(cache.get(i).await.unwrap(), i);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 50, "cached values reloaded");
    }

    #[tokio::test]
    async fn test_exact_lru_eviction_order() {
        let loads = Arc::new(AtomicU32::new(0));
        let cache = identity_cache(100, Arc::clone(&loads));
        for i in 0..123 {
            assert_eq!(cache.get(i).await.unwrap(), i);
            assert_eq!(loads.load(Ordering::SeqCst), (i + 1) as u32);
        }
        for i in 0..23 {
            assert!(!cache.contains(&i), "expected {i} evicted");
        }
        let current = loads.load(Ordering::SeqCst);
        for i in 23..123 {
            assert!(cache.contains(&i), "expected {i} present");
            assert_eq!(cache.get(i).await.unwrap(), i);
        }
        assert_eq!(loads.load(Ordering::SeqCst), current);
    }

    #[tokio::test]
    async fn test_eviction_respects_access_order() {
        let loads = Arc::new(AtomicU32::new(0));
        let cache = identity_cache(2, Arc::clone(&loads));
        cache.get(1).await.unwrap();
        cache.get(2).await.unwrap();
        // touch 1 so that 2 is the least recently used
        cache.get(1).await.unwrap();
        cache.get(3).await.unwrap();
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_load() {
        let loads = Arc::new(AtomicU32::new(0));
        let loads_c = Arc::clone(&loads);
        let cache: Arc<SingleFlightCache<String, String>> = Arc::new(SingleFlightCache::new(
            100,
            Arc::new(move |key: String| {
                let loads = Arc::clone(&loads_c);
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(key)
                }) as LoadFuture<String>
            }),
        ));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get("key1".to_string()).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "key1");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_marshalled_keys_share_value() {
        let loads = Arc::new(AtomicU32::new(0));
        let loads_c = Arc::clone(&loads);
        let cache: SingleFlightCache<Vec<String>, usize> = SingleFlightCache::new(
            100,
            Arc::new(move |key: Vec<String>| {
                let loads = Arc::clone(&loads_c);
                Box::pin(async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(key.len())
                }) as LoadFuture<usize>
            }),
        )
        .with_marshaller(Arc::new(|key: &Vec<String>| {
            CacheKey::Text(format!("{key:?}"))
        }));

        let k = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        for _ in 0..3 {
            assert_eq!(cache.get(k.clone()).await.unwrap(), 3);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiter_deadline_does_not_cancel_load() {
        let loads = Arc::new(AtomicU32::new(0));
        let loads_c = Arc::clone(&loads);
        let cache: Arc<SingleFlightCache<i64, i64>> = Arc::new(SingleFlightCache::new(
            100,
            Arc::new(move |key: i64| {
                let loads = Arc::clone(&loads_c);
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok(key)
                }) as LoadFuture<i64>
            }),
        ));

        let impatient = cache
            .get_with_deadline(7, Some(Instant::now() + Duration::from_millis(10)))
            .await;
        match impatient {
            Err(e) => assert!(matches!(*e, KestrelError::DeadlineExceeded)),
            Ok(v) => panic!("expected deadline, got {v}"),
        }

        // the shared load completed anyway and its value is cached
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.contains(&7));
        assert_eq!(cache.get(7).await.unwrap(), 7);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_errors_are_shared_and_not_cached() {
        let loads = Arc::new(AtomicU32::new(0));
        let loads_c = Arc::clone(&loads);
        let cache: Arc<SingleFlightCache<i64, i64>> = Arc::new(SingleFlightCache::new(
            100,
            Arc::new(move |key: i64| {
                let loads = Arc::clone(&loads_c);
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    loads.fetch_add(1, Ordering::SeqCst);
                    Err(KestrelError::Deserialization(format!("invalid key {key}")))
                }) as LoadFuture<i64>
            }),
        ));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { cache.get(5).await }));
        }
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(matches!(*err, KestrelError::Deserialization(_)));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1, "failed load ran more than once");
        assert!(!cache.contains(&5), "failures must not be cached");

        // a later get retries the load
        let _ = cache.get(5).await;
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
