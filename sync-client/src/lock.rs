//! Striped keyed lock.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::{Mutex, MutexGuard};

/// A fixed set of async mutexes; a key locks stripe `hash(key) mod N`.
///
/// Two keys may share a stripe. Two holders of the same key never overlap.
#[derive(Debug)]
pub struct StripedLock {
    stripes: Vec<Mutex<()>>,
}

impl StripedLock {
    /// `stripes` mutexes (at least one).
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Number of stripes.
    pub fn stripes(&self) -> usize {
        self.stripes.len()
    }

    /// Stripe `key` maps to.
    pub fn stripe_index<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }

    /// Lock the stripe of `key`.
    pub async fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_index(key)].lock().await
    }
}
