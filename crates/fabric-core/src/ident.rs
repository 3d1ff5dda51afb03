//! Identifier registry binding guest calls to their instance.
//!
//! Every call is handed a fresh random non-negative `i32`. The guest passes it
//! back as the last argument of every host function, and the host resolves it
//! here to the [`CallContext`] of the call. The binding lives exactly as long
//! as the [`IdentGuard`] returned by [`IdentifierRegistry::register`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use rand::Rng;
use rand::rngs::OsRng;
use tracing::trace;

use fabric_common::HostCallError;

use crate::store::CallContext;

/// The call context bound to an identifier, with its owning instance.
#[derive(Debug, Clone)]
struct Binding {
    instance_id: u64,
    ctx: Arc<Mutex<CallContext>>,
}

/// Concurrent map from identifier to in-flight call.
#[derive(Debug, Default)]
pub struct IdentifierRegistry {
    bindings: DashMap<i32, Binding>,
    next_instance_id: AtomicU64,
}

impl IdentifierRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a process-unique instance id.
    pub fn next_instance_id(&self) -> u64 {
        self.next_instance_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Bind a fresh identifier to `ctx` on instance `instance_id`.
    ///
    /// Identifiers are drawn from the OS random source; a collision with a
    /// live identifier draws again.
    pub fn register(
        self: &Arc<Self>,
        instance_id: u64,
        ctx: Arc<Mutex<CallContext>>,
    ) -> IdentGuard {
        let binding = Binding { instance_id, ctx };
        loop {
            let ident = OsRng.gen_range(0..=i32::MAX);
            if let Entry::Vacant(slot) = self.bindings.entry(ident) {
                slot.insert(binding);
                trace!(ident, instance_id, "Identifier bound");
                return IdentGuard {
                    registry: Arc::clone(self),
                    ident,
                };
            }
        }
    }

    /// Resolve `ident` for a host call made by instance `instance_id`.
    pub fn resolve(
        &self,
        ident: i32,
        instance_id: u64,
    ) -> Result<Arc<Mutex<CallContext>>, HostCallError> {
        let binding = self
            .bindings
            .get(&ident)
            .ok_or(HostCallError::UnknownIdentifier { ident })?;
        if binding.instance_id != instance_id {
            return Err(HostCallError::IdentifierMismatch { ident });
        }
        Ok(Arc::clone(&binding.ctx))
    }

    /// Returns `true` if `ident` is currently bound.
    pub fn contains(&self, ident: i32) -> bool {
        self.bindings.contains_key(&ident)
    }

    /// Number of bound identifiers for `instance_id`.
    pub fn count_for_instance(&self, instance_id: u64) -> usize {
        self.bindings
            .iter()
            .filter(|entry| entry.instance_id == instance_id)
            .count()
    }

    /// Number of bound identifiers.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Returns `true` if no identifier is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn remove(&self, ident: i32) {
        self.bindings.remove(&ident);
        trace!(ident, "Identifier released");
    }
}

/// Removes its identifier from the registry on drop.
#[derive(Debug)]
pub struct IdentGuard {
    registry: Arc<IdentifierRegistry>,
    ident: i32,
}

impl IdentGuard {
    /// The bound identifier.
    pub fn ident(&self) -> i32 {
        self.ident
    }
}

impl Drop for IdentGuard {
    fn drop(&mut self) {
        self.registry.remove(self.ident);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_common::CoordinatedRequest;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> Arc<Mutex<CallContext>> {
        let (result_tx, _) = mpsc::channel(1);
        let (error_tx, _) = mpsc::channel(1);
        Arc::new(Mutex::new(CallContext::new(
            "fqmn://t/ns/m@r".into(),
            CoordinatedRequest::default(),
            result_tx,
            error_tx,
            CancellationToken::new(),
        )))
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = Arc::new(IdentifierRegistry::new());
        let guard = registry.register(7, ctx());

        assert!(guard.ident() >= 0);
        assert!(registry.contains(guard.ident()));
        assert_eq!(registry.count_for_instance(7), 1);
        assert!(registry.resolve(guard.ident(), 7).is_ok());
    }

    #[test]
    fn test_resolve_rejects_other_instance() {
        let registry = Arc::new(IdentifierRegistry::new());
        let guard = registry.register(1, ctx());

        assert_eq!(
            registry.resolve(guard.ident(), 2).unwrap_err(),
            HostCallError::IdentifierMismatch {
                ident: guard.ident()
            }
        );
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let registry = Arc::new(IdentifierRegistry::new());
        let ident = {
            let guard = registry.register(1, ctx());
            guard.ident()
        };

        assert!(registry.is_empty());
        assert_eq!(
            registry.resolve(ident, 1).unwrap_err(),
            HostCallError::UnknownIdentifier { ident }
        );
    }

    #[test]
    fn test_identifiers_unique_while_live() {
        let registry = Arc::new(IdentifierRegistry::new());
        let guards: Vec<_> = (0..1000).map(|i| registry.register(i, ctx())).collect();

        let mut idents: Vec<i32> = guards.iter().map(IdentGuard::ident).collect();
        idents.sort_unstable();
        idents.dedup();
        assert_eq!(idents.len(), 1000);
        assert_eq!(registry.len(), 1000);

        drop(guards);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let registry = IdentifierRegistry::new();
        let a = registry.next_instance_id();
        let b = registry.next_instance_id();
        assert_ne!(a, b);
        assert!(a > 0);
    }
}
