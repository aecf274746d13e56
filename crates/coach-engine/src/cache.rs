use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

struct Slot<V> {
    value: Option<V>,
    version: u64,
}

/// In-process copy of remote records.
///
/// Values only ever come from a store response (`put` / `resync`); a failed
/// resync drops the entry instead of keeping a value that may be wrong.
///
/// Every `put` and `invalidate` bumps the key's version. A fetch started
/// before such a write never lands in the cache once it completes.
pub struct ReadThroughCache<K, V> {
    entries: DashMap<K, Slot<V>>,
    clock: AtomicU64,
}

impl<K, V> ReadThroughCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key).and_then(|slot| slot.value.clone())
    }

    pub fn put(&self, key: K, value: V) {
        let version = self.tick();
        self.entries.insert(
            key,
            Slot {
                value: Some(value),
                version,
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        let version = self.tick();
        self.entries.insert(
            key.clone(),
            Slot {
                value: None,
                version,
            },
        );
    }

    /// Refetch `key` from the source of truth.
    ///
    /// If the key was written while the fetch was in flight, the newer cached
    /// value wins and is returned; the fetched value is discarded.
    pub async fn resync<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let seen = self.version(&key);
        let fetched = fetch().await;

        match self.entries.entry(key) {
            Entry::Occupied(slot) if slot.get().version != seen => {
                fetched.map(|value| slot.get().value.clone().unwrap_or(value))
            }
            Entry::Occupied(mut slot) => match fetched {
                Ok(value) => {
                    let version = self.tick();
                    *slot.get_mut() = Slot {
                        value: Some(value.clone()),
                        version,
                    };
                    Ok(value)
                }
                Err(e) => {
                    slot.remove();
                    Err(e)
                }
            },
            Entry::Vacant(vacant) => {
                if let Ok(value) = &fetched {
                    let version = self.tick();
                    vacant.insert(Slot {
                        value: Some(value.clone()),
                        version,
                    });
                }
                fetched
            }
        }
    }

    /// Cached value, or `resync` on a miss.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(&key) {
            return Ok(hit);
        }
        self.resync(key, fetch).await
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|slot| slot.value.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn version(&self, key: &K) -> u64 {
        self.entries.get(key).map_or(0, |slot| slot.version)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl<K, V> Default for ReadThroughCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
