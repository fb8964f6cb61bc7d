use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_MAX_SIZE: usize = 10_000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct Entry<V> {
    value: V,
    inserted: Instant,
    // Breaks ties between entries inserted within the same clock tick.
    seq: u64,
}

struct Inner<V> {
    map: HashMap<String, Entry<V>>,
    next_seq: u64,
}

/// A bounded key-value store whose entries expire `ttl` after insertion.
///
/// The size bound is enforced when inserting: a new key arriving at a full
/// cache evicts the single oldest entry. Expired entries stay invisible to
/// [`TtlCache::get`] and are removed by [`TtlCache::sweep`].
pub struct TtlCache<V> {
    inner: RwLock<Inner<V>>,
    max_size: usize,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    /// `max_size == 0` selects [`DEFAULT_MAX_SIZE`].
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        let max_size = if max_size == 0 {
            DEFAULT_MAX_SIZE
        } else {
            max_size
        };

        Self {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                next_seq: 0,
            }),
            max_size,
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let inner = self.read();
        inner
            .map
            .get(key)
            .filter(|entry| entry.inserted.elapsed() <= self.ttl)
            .map(|entry| entry.value.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let mut inner = self.write();

        if !inner.map.contains_key(&key) && inner.map.len() >= self.max_size {
            Self::evict_oldest(&mut inner.map);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.map.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
                seq,
            },
        );
    }

    fn evict_oldest(map: &mut HashMap<String, Entry<V>>) {
        let oldest = map
            .iter()
            .min_by_key(|(_, entry)| (entry.inserted, entry.seq))
            .map(|(key, _)| key.clone());

        if let Some(key) = oldest {
            map.remove(&key);
        }
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let mut inner = self.write();
        let before = inner.map.len();
        inner
            .map
            .retain(|_, entry| entry.inserted.elapsed() <= self.ttl);
        before - inner.map.len()
    }

    pub fn len(&self) -> usize {
        self.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.write().map.clear();
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    // A panic while holding the lock cannot leave the map half-updated, so
    // poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Inner<V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// Sweeps expired entries every `period` until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let period = if period.is_zero() {
            DEFAULT_SWEEP_INTERVAL
        } else {
            period
        };

        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    debug!("Cache sweeper shutting down");
                    break;
                }

                _ = interval.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!(removed, remaining = self.len(), "Swept expired cache entries");
                    }
                }
            }
        }
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        info!(
            max_size = self.max_size,
            ttl_secs = self.ttl.as_secs(),
            "Starting lookup cache"
        );
        tokio::spawn(self.clone().run_sweeper(period, shutdown))
    }
}
