//! Tenant-scoped key/value cache.
//!
//! - `cache_set(key_ptr, key_len, val_ptr, val_len, ttl, ident)`
//! - `cache_get(key_ptr, key_len, ident)`
//!
//! Keys are scoped to the tenant of the calling module, so two tenants never
//! see each other's entries. A TTL of zero or less means the entry does not
//! expire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::debug;

use fabric_common::{Clock, Fqmn, HostCallError, SystemClock};
use fabric_core::{HostCall, HostRegistry, Returns, complete, reject};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Bounded, TTL-aware cache shared by every call.
#[derive(Debug)]
pub struct GuestCache {
    entries: DashMap<(String, String), Entry>,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl GuestCache {
    /// Create a cache holding at most `max_entries` entries.
    pub fn new(max_entries: usize) -> Self {
        Self::with_clock(max_entries, Arc::new(SystemClock))
    }

    /// Create a cache reading time from `clock`.
    pub fn with_clock(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            clock,
        }
    }

    /// Store `value` under `(tenant, key)`.
    pub fn set(&self, tenant: &str, key: &str, value: Vec<u8>, ttl_secs: i32) {
        let expires_at = u64::try_from(ttl_secs)
            .ok()
            .filter(|&secs| secs > 0)
            .map(|secs| self.clock.now() + Duration::from_secs(secs));
        let key = (tenant.to_string(), key.to_string());

        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.make_room();
        }
        self.entries.insert(key, Entry { value, expires_at });
    }

    /// Fetch the live value under `(tenant, key)`.
    pub fn get(&self, tenant: &str, key: &str) -> Option<Vec<u8>> {
        let key = (tenant.to_string(), key.to_string());
        let now = self.clock.now();
        let entry = self.entries.get(&key)?;
        if entry.expires_at.is_some_and(|at| at <= now) {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Number of stored entries, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries; if still full, drop the entry closest to expiry.
    fn make_room(&self) {
        let now = self.clock.now();
        self.entries
            .retain(|_, entry| entry.expires_at.is_none_or(|at| at > now));
        if self.entries.len() < self.max_entries {
            return;
        }

        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.expires_at.map_or((1, now), |at| (0, at)))
            .map(|entry| entry.key().clone());
        if let Some(victim) = victim {
            debug!(tenant = %victim.0, key = %victim.1, "Cache full, evicting entry");
            self.entries.remove(&victim);
        }
    }
}

/// Register `cache_set` and `cache_get`.
pub fn register(registry: &mut HostRegistry, cache: Arc<GuestCache>) {
    let set = Arc::clone(&cache);
    registry.register("cache_set", 6, Returns::Value, move |call| {
        cache_set(Arc::clone(&set), call)
    });
    registry.register("cache_get", 3, Returns::Value, move |call| {
        cache_get(Arc::clone(&cache), call)
    });
}

fn tenant_of(fqmn: &str) -> Result<String, HostCallError> {
    Fqmn::parse(fqmn)
        .map(|f| f.tenant)
        .map_err(|e| HostCallError::Capability(format!("cannot scope cache to '{fqmn}': {e}")))
}

fn cache_set(cache: Arc<GuestCache>, mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.data_context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("cache_set", ident, &e),
        };
        let (key_ptr, key_len, val_ptr, val_len, ttl) =
            (call.arg(0), call.arg(1), call.arg(2), call.arg(3), call.arg(4));

        let tenant = tenant_of(ctx.lock().fqmn());
        let result = tenant.and_then(|tenant| {
            let key = call.read_string(key_ptr, key_len)?;
            let value = call.read_memory(val_ptr, val_len)?;
            cache.set(&tenant, &key, value, ttl);
            Ok(())
        });
        match result {
            Ok(()) => 0,
            Err(e) => complete(&ctx, Err(e)),
        }
    })
}

fn cache_get(cache: Arc<GuestCache>, mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let ident = call.ident();
        let ctx = match call.data_context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("cache_get", ident, &e),
        };
        let (key_ptr, key_len) = (call.arg(0), call.arg(1));

        let tenant = tenant_of(ctx.lock().fqmn());
        let result = tenant.and_then(|tenant| {
            let key = call.read_string(key_ptr, key_len)?;
            cache
                .get(&tenant, &key)
                .ok_or_else(|| HostCallError::Capability(format!("key '{key}' not found")))
        });
        complete(&ctx, result)
    })
}
