//! Replay cache.
//!
//! Two-level map: outer key id → inner `nonce → expiryUnix`. A nonce is
//! accepted exactly once per key id until its TTL elapses; `delete_key`
//! drops a whole partition when a key id is unbound. A periodic GC sweep
//! removes expired nonces and empty partitions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;

pub struct NonceCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, HashMap<String, u64>>>,
}

impl NonceCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record `(kid, nonce)`. Returns true when the pair was already seen
    /// (replay), false on first sight.
    pub fn seen_once(&self, kid: &str, nonce: &str) -> bool {
        let now = self.clock.unix_secs();
        let mut entries = self.entries.write().expect("nonce cache poisoned");
        let inner = entries.entry(kid.to_string()).or_default();
        if let Some(&expiry) = inner.get(nonce) {
            if expiry >= now {
                return true;
            }
        }
        inner.insert(nonce.to_string(), now + self.ttl.as_secs());
        false
    }

    /// Drop the whole partition for `kid`.
    pub fn delete_key(&self, kid: &str) {
        self.entries
            .write()
            .expect("nonce cache poisoned")
            .remove(kid);
    }

    /// Remove expired nonces and empty partitions.
    pub fn gc(&self) {
        let now = self.clock.unix_secs();
        let mut entries = self.entries.write().expect("nonce cache poisoned");
        let before: usize = entries.values().map(HashMap::len).sum();
        for inner in entries.values_mut() {
            inner.retain(|_, &mut expiry| expiry >= now);
        }
        entries.retain(|_, inner| !inner.is_empty());
        let after: usize = entries.values().map(HashMap::len).sum();
        if before != after {
            debug!(removed = before - after, "nonce cache GC");
        }
    }

    /// Spawn the GC loop. The task runs until the handle is aborted.
    pub fn spawn_gc(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                cache.gc();
            }
        })
    }

    #[cfg(test)]
    fn partition_len(&self, kid: &str) -> usize {
        self.entries
            .read()
            .expect("nonce cache poisoned")
            .get(kid)
            .map_or(0, HashMap::len)
    }
}
