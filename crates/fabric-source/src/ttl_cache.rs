//! A TTL cache whose loads are coalesced per key.
//!
//! The first caller to miss on a key becomes its loader. Callers that arrive
//! while that load is in flight park on it and all observe the single result.
//! Only successful loads are stored: a failed or canceled load leaves the key
//! empty and the next caller starts a fresh one.
//!
//! The loader runs without the map lock held; the lock is taken only to claim
//! a key and to publish the outcome.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fabric_common::{Clock, FabricError, SystemClock};

type Loaded<V> = Option<Result<V, FabricError>>;

enum Slot<V> {
    Loading {
        generation: u64,
        done: watch::Receiver<Loaded<V>>,
    },
    Ready {
        value: V,
        expires_at: Instant,
    },
}

enum Claim<V> {
    Hit(V),
    Wait(watch::Receiver<Loaded<V>>),
    Load {
        generation: u64,
        done: watch::Sender<Loaded<V>>,
    },
}

/// Coalescing read-through cache with a fixed TTL.
pub struct TtlCache<K, V> {
    name: &'static str,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<K, Slot<V>>>,
    generation: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    /// Create a cache on the system clock. `name` tags log lines.
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self::with_clock(name, ttl, Arc::new(SystemClock))
    }

    /// Create a cache on `clock`.
    pub fn with_clock(name: &'static str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            ttl,
            clock,
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// The entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The cached value for `key`, if present and unexpired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        match self.slots.lock().get(key) {
            Some(Slot::Ready { value, expires_at }) if now < *expires_at => Some(value.clone()),
            _ => None,
        }
    }

    /// Store `value` without a load.
    pub fn insert(&self, key: K, value: V) {
        let expires_at = self.clock.after(self.ttl);
        self.slots
            .lock()
            .insert(key, Slot::Ready { value, expires_at });
    }

    /// Forget `key`. A load in flight still completes but is not stored.
    pub fn invalidate(&self, key: &K) {
        self.slots.lock().remove(key);
    }

    /// Number of stored values, expired ones included.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready { .. }))
            .count()
    }

    /// Whether no values are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the value for `key`, running `load` if it is missing or
    /// expired and no other caller is already loading it.
    ///
    /// # Errors
    ///
    /// Returns the loader's error (shared with every caller parked on the
    /// same load), or `Canceled` if `cancel` fires or the loading caller
    /// goes away.
    pub async fn get_or_load<F, Fut>(
        &self,
        key: &K,
        cancel: &CancellationToken,
        load: F,
    ) -> Result<V, FabricError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, FabricError>>,
    {
        match self.claim(key) {
            Claim::Hit(value) => Ok(value),
            Claim::Wait(done) => self.wait(done, cancel).await,
            Claim::Load { generation, done } => {
                debug!(cache = self.name, key = ?key, "Cache miss, loading");
                let result = tokio::select! {
                    () = cancel.cancelled() => Err(self.canceled()),
                    result = load() => result,
                };
                self.publish(key, generation, &result);
                done.send_replace(Some(result.clone()));
                result
            }
        }
    }

    fn claim(&self, key: &K) -> Claim<V> {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(Slot::Ready { value, expires_at }) if now < *expires_at => {
                return Claim::Hit(value.clone());
            }
            // A receiver whose sender is gone belongs to an abandoned load.
            Some(Slot::Loading { done, .. }) if done.has_changed().is_ok() => {
                return Claim::Wait(done.clone());
            }
            _ => {}
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        slots.insert(
            key.clone(),
            Slot::Loading {
                generation,
                done: rx,
            },
        );
        Claim::Load {
            generation,
            done: tx,
        }
    }

    async fn wait(
        &self,
        mut done: watch::Receiver<Loaded<V>>,
        cancel: &CancellationToken,
    ) -> Result<V, FabricError> {
        let loaded = tokio::select! {
            () = cancel.cancelled() => None,
            loaded = done.wait_for(Option::is_some) => loaded.ok().and_then(|r| (*r).clone()),
        };
        loaded.unwrap_or_else(|| Err(self.canceled()))
    }

    fn publish(&self, key: &K, generation: u64, result: &Result<V, FabricError>) {
        let mut slots = self.slots.lock();
        let current = matches!(
            slots.get(key),
            Some(Slot::Loading { generation: g, .. }) if *g == generation
        );
        if !current {
            return;
        }

        match result {
            Ok(value) => {
                let expires_at = self.clock.after(self.ttl);
                slots.insert(
                    key.clone(),
                    Slot::Ready {
                        value: value.clone(),
                        expires_at,
                    },
                );
            }
            Err(e) => {
                slots.remove(key);
                debug!(cache = self.name, key = ?key, error = %e, "Load failed, not cached");
            }
        }
    }

    fn canceled(&self) -> FabricError {
        FabricError::canceled(format!("{} load", self.name))
    }
}

impl<K, V> Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("slots", &self.slots.lock().len())
            .finish_non_exhaustive()
    }
}
