//! Per-key mutual exclusion and the keyholder table.
//!
//! Keys are mapped onto a fixed, power-of-two array of mutexes by hashing the
//! key bytes seeded with the region identity; holding the stripe serializes
//! every operation touching that key. The keyholder table itself is a
//! concurrent map that may be probed and mutated without the stripe lock,
//! which is why erasure re-verifies identity under the stripe: an iterator's
//! snapshot may be stale by the time its entry is processed.

use super::keyholder::KeyHolder;
use crate::config::RegionId;

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// A fixed-width array of mutexes striping the key space.
pub struct StripedLock {
    stripes: Vec<Mutex<()>>,
}

impl StripedLock {
    pub fn new(stripes: usize) -> Self {
        assert!(stripes.is_power_of_two());
        Self { stripes: (0..stripes).map(|_| Mutex::new(())).collect() }
    }

    /// Locks the stripe covering a key. The guard must be held for any
    /// keyholder access under this (region, key).
    pub fn lock(&self, region: &RegionId, key: &[u8]) -> MutexGuard<'_, ()> {
        let stripe = xxh3_64_with_seed(key, region.hash()) as usize & (self.stripes.len() - 1);
        self.stripes[stripe].lock().expect("stripe lock poisoned")
    }
}

/// A keyholder table key.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct KeyPair {
    pub region: RegionId,
    pub key: Bytes,
}

impl KeyPair {
    pub fn new(region: RegionId, key: Bytes) -> Self {
        Self { region, key }
    }
}

/// The concurrent keyholder table. Entries are shared via Arc so that an
/// erase can race a lookup without invalidating the op in flight; the mutex
/// inside each entry is uncontended given the stripe lock.
pub struct KeyHolderMap {
    map: DashMap<KeyPair, Arc<Mutex<KeyHolder>>>,
}

impl KeyHolderMap {
    pub fn new(capacity: usize) -> Self {
        Self { map: DashMap::with_capacity(capacity) }
    }

    /// Returns the keyholder for a key, creating it if absent. Creation
    /// never overwrites a concurrent insert.
    pub fn get_or_insert(&self, region: &RegionId, key: &Bytes) -> Arc<Mutex<KeyHolder>> {
        self.map
            .entry(KeyPair::new(*region, key.clone()))
            .or_insert_with(|| Arc::new(Mutex::new(KeyHolder::new())))
            .value()
            .clone()
    }

    pub fn lookup(&self, region: &RegionId, key: &Bytes) -> Option<Arc<Mutex<KeyHolder>>> {
        self.map.get(&KeyPair::new(*region, key.clone())).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, pair: &KeyPair) {
        self.map.remove(pair);
    }

    /// Removes the entry only if it still maps to the given keyholder.
    /// Callers hold the stripe lock, so a successful identity check cannot
    /// race a re-insert for the same key.
    pub fn remove_if_same(&self, region: &RegionId, key: &Bytes, kh: &Arc<Mutex<KeyHolder>>) {
        let pair = KeyPair::new(*region, key.clone());
        self.map.remove_if(&pair, |_, current| Arc::ptr_eq(current, kh));
    }

    /// Snapshots the current key set. Iteration works from this snapshot and
    /// re-looks-up every entry under its stripe lock, so concurrent inserts
    /// and removals are tolerated.
    pub fn keys(&self) -> Vec<KeyPair> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
