//! Keyed singleflight.
//!
//! Concurrent callers with the same key share one in-flight computation
//! and all observe its result; the key is released once the computation
//! settles so a later call starts fresh. Used to collapse resolver
//! stampedes keyed by `(ctxID, did)`.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

pub struct Singleflight<K, V> {
    inflight: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for Singleflight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Singleflight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` under `key`, sharing the outcome with every concurrent
    /// caller holding the same key. Exactly one caller executes `work`.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut inflight = self.inflight.lock().expect("singleflight lock poisoned");
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let value = cell.get_or_init(work).await.clone();

        let mut inflight = self.inflight.lock().expect("singleflight lock poisoned");
        if let Some(current) = inflight.get(&key) {
            if Arc::ptr_eq(current, &cell) {
                inflight.remove(&key);
            }
        }
        value
    }
}
