use std::{
    hash::Hash,
    sync::atomic::{AtomicU32, Ordering},
};

use dashmap::{mapref::entry::Entry, DashMap};
use fnv::FnvBuildHasher;
use pyroprof_common::{
    profiler::{PidConfigMap, SampleCounts},
    PidConfig, SampleKey, BPF_EXIST, BPF_NOEXIST,
};

use super::MapError;

/// Bounded concurrent hash map with the update semantics of a BPF hash map.
///
/// Every operation is atomic on its own; there is no way to make a lookup and
/// a later insert atomic together.
pub struct SharedMap<K, V> {
    inner: DashMap<K, V, FnvBuildHasher>,
    len: AtomicU32,
    max_entries: u32,
}

pub type PidMap = SharedMap<u32, PidConfig>;
pub type CountsMap = SharedMap<SampleKey, AtomicU32>;

impl<K: Eq + Hash + Clone, V> SharedMap<K, V> {
    pub fn with_max_entries(max_entries: u32) -> Self {
        Self {
            inner: DashMap::with_capacity_and_hasher(max_entries as usize, FnvBuildHasher::default()),
            len: AtomicU32::new(0),
            max_entries,
        }
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Runs `f` on the value in place, under the shard's read lock
    pub fn get_with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.inner.get(key).map(|v| f(v.value()))
    }

    /// `flags` is one of `BPF_ANY`, `BPF_NOEXIST`, `BPF_EXIST`
    pub fn insert(&self, key: K, value: V, flags: u64) -> Result<(), MapError> {
        if flags > BPF_EXIST {
            return Err(MapError::InvalidFlags(flags));
        }

        match self.inner.entry(key) {
            Entry::Occupied(mut e) => {
                if flags == BPF_NOEXIST {
                    return Err(MapError::KeyExists);
                }
                e.insert(value);
            }
            Entry::Vacant(e) => {
                if flags == BPF_EXIST {
                    return Err(MapError::KeyNotFound);
                }
                // the shard is locked here, only the total can race
                if self.len.fetch_add(1, Ordering::AcqRel) >= self.max_entries {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    return Err(MapError::Full { max_entries: self.max_entries });
                }
                e.insert(value);
            }
        }
        Ok(())
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let (_, v) = self.inner.remove(key)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(v)
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    /// Lookup-and-delete of every entry present when the call started
    pub fn drain(&self) -> Vec<(K, V)> {
        self.keys()
            .into_iter()
            .filter_map(|k| {
                let kv = self.inner.remove(&k)?;
                self.len.fetch_sub(1, Ordering::AcqRel);
                Some(kv)
            })
            .collect()
    }
}

impl<K: Eq + Hash + Clone, V: Copy> SharedMap<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).map(|v| *v)
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }
}

impl CountsMap {
    pub fn count(&self, key: &SampleKey) -> Option<u32> {
        self.get_with(key, |c| c.load(Ordering::Relaxed))
    }

    pub fn drain_counts(&self) -> Vec<(SampleKey, u32)> {
        self.drain()
            .into_iter()
            .map(|(k, c)| (k, c.into_inner()))
            .collect()
    }
}

impl PidConfigMap for PidMap {
    fn get(&self, pid: u32) -> Option<PidConfig> {
        SharedMap::get(self, &pid)
    }

    fn insert_new(&self, pid: u32, config: &PidConfig) -> Result<(), i64> {
        self.insert(pid, *config, BPF_NOEXIST).map_err(|e| e.errno())
    }
}

impl SampleCounts for CountsMap {
    fn increment(&self, key: &SampleKey) -> bool {
        self.get_with(key, |c| c.fetch_add(1, Ordering::Relaxed)).is_some()
    }

    fn insert_new(&self, key: &SampleKey, count: u32) -> Result<(), i64> {
        self.insert(*key, AtomicU32::new(count), BPF_NOEXIST)
            .map_err(|e| e.errno())
    }
}
