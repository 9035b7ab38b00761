//! Time-bounded cache for fetched collaborator data.
//!
//! Instances are owned by whoever needs them (the server state, a test) and
//! passed by reference; nothing here is process-global.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct Slot<V> {
    value: V,
    fetched_at: Instant,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Value for `key` if it was fetched less than `ttl` ago.
    pub async fn get_fresh(&self, key: &K) -> Option<V> {
        let slots = self.slots.lock().await;
        slots
            .get(key)
            .filter(|slot| slot.fetched_at.elapsed() < self.ttl)
            .map(|slot| slot.value.clone())
    }

    pub async fn insert(&self, key: K, value: V) {
        self.slots.lock().await.insert(
            key,
            Slot {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, key: &K) {
        self.slots.lock().await.remove(key);
    }

    /// Return the cached value while it is fresh; otherwise call `fetch` with
    /// the expired value (if any) so it can revalidate, and store the result.
    ///
    /// The lock is not held while `fetch` runs.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce(Option<V>) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let stale = {
            let slots = self.slots.lock().await;
            match slots.get(&key) {
                Some(slot) if slot.fetched_at.elapsed() < self.ttl => {
                    debug!("cache hit for {:?}", key);
                    return Ok(slot.value.clone());
                }
                Some(slot) => Some(slot.value.clone()),
                None => None,
            }
        };

        debug!("cache miss for {:?} (stale copy: {})", key, stale.is_some());
        let value = fetch(stale).await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }
}
