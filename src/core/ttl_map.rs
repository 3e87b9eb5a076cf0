//! Concurrent map whose entries expire a fixed time after insertion.
use std::{hash::Hash, time::Duration};

use scc::hash_map::Entry;
use tokio::time::Instant;

#[derive(Clone)]
struct Expiring<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Expiring<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// `scc::HashMap` whose entries stop being visible once their deadline passes.
///
/// Expired entries are dropped lazily on lookup, or in bulk by
/// [`TtlMap::purge_expired`]. Deadlines use the tokio clock.
pub(crate) struct TtlMap<K, V> {
    entries: scc::HashMap<K, Expiring<V>>,
    ttl: Duration,
}

impl<K, V> TtlMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            entries: scc::HashMap::new(),
            ttl,
        }
    }

    pub(crate) async fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let cached = self
            .entries
            .get_async(key)
            .await
            .map(|entry| entry.get().clone())?;

        if cached.is_expired(now) {
            self.entries
                .remove_if_async(key, |entry| entry.is_expired(now))
                .await;
            return None;
        }
        Some(cached.value)
    }

    pub(crate) async fn insert(&self, key: K, value: V) {
        let entry = Expiring {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        match self.entries.entry_async(key).await {
            Entry::Occupied(mut occupied) => {
                *occupied.get_mut() = entry;
            }
            Entry::Vacant(vacant) => {
                vacant.insert_entry(entry);
            }
        }
    }

    pub(crate) async fn remove(&self, key: &K) -> bool {
        self.entries.remove_async(key).await.is_some()
    }

    /// Removes `key` and returns its value if it was still live.
    pub(crate) async fn take(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let (_, entry) = self.entries.remove_async(key).await?;
        (!entry.is_expired(now)).then_some(entry.value)
    }

    pub(crate) async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain_async(|_, entry| !entry.is_expired(now))
            .await;
        before.saturating_sub(self.entries.len())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
