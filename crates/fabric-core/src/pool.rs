//! Per-module pool of warm instances.
//!
//! A pool compiles nothing itself: it is handed a [`CompiledModule`] and
//! instantiates it on demand. Idle instances wait in a bounded channel; an
//! acquired instance is wrapped in a [`PooledInstance`] that decides on drop
//! whether the instance goes back to the pool or is discarded.
//!
//! Instances are returned to the pool after a clean call. An instance that
//! trapped, timed out or was abandoned mid-call is discarded and a replacement
//! is instantiated in the background. The number of live instances (idle plus
//! in flight plus being created) never exceeds the capacity.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use wasmtime::Linker;

use fabric_common::{ExecutionConfig, FabricError, PoolConfig};

use crate::WasmEngine;
use crate::ident::IdentifierRegistry;
use crate::instance::Instance;
use crate::module::CompiledModule;
use crate::store::InstanceState;

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Everything needed to instantiate one more instance of a module.
#[derive(Clone)]
pub struct InstanceFactory {
    engine: WasmEngine,
    module: CompiledModule,
    linker: Arc<Linker<InstanceState>>,
    idents: Arc<IdentifierRegistry>,
    execution: ExecutionConfig,
}

impl InstanceFactory {
    /// Create a factory for `module`.
    pub fn new(
        engine: WasmEngine,
        module: CompiledModule,
        linker: Arc<Linker<InstanceState>>,
        idents: Arc<IdentifierRegistry>,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            engine,
            module,
            linker,
            idents,
            execution,
        }
    }

    /// Instantiate a fresh instance.
    pub async fn instantiate(&self) -> Result<Instance, FabricError> {
        Instance::new(
            &self.engine,
            &self.module,
            &self.linker,
            Arc::clone(&self.idents),
            &self.execution,
        )
        .await
    }

    /// The compiled module instances are created from.
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }
}

impl std::fmt::Debug for InstanceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceFactory")
            .field("module", &self.module)
            .finish_non_exhaustive()
    }
}

/// What happens to an instance when its [`PooledInstance`] is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Put the instance back on the idle queue.
    ReturnToPool,
    /// Drop the instance and instantiate a replacement.
    Discard,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum live instances.
    pub capacity: usize,
    /// Live instances: idle, in flight, or being created.
    pub live: usize,
    /// Idle instances waiting on the queue.
    pub available: usize,
}

impl PoolStats {
    /// Instances acquired or being created.
    pub fn in_flight(&self) -> usize {
        self.live.saturating_sub(self.available)
    }
}

/// A pool of warm instances of one module.
pub struct InstancePool {
    name: String,
    factory: InstanceFactory,
    capacity: usize,
    available_tx: mpsc::Sender<Instance>,
    available_rx: Mutex<mpsc::Receiver<Instance>>,
    live: AtomicUsize,
    closed: CancellationToken,
}

impl InstancePool {
    /// Build a pool and pre-warm it.
    ///
    /// The first instance is created before returning so a module that cannot
    /// be instantiated fails here. The remaining `prewarm - 1` instances are
    /// created in the background; their failures are logged.
    #[instrument(skip(factory, config), fields(capacity = config.capacity))]
    pub async fn new(
        name: impl Into<String> + std::fmt::Debug,
        factory: InstanceFactory,
        config: &PoolConfig,
    ) -> Result<Arc<Self>, FabricError> {
        let capacity = config.capacity.max(1);
        let (available_tx, available_rx) = mpsc::channel(capacity);

        let pool = Arc::new(Self {
            name: name.into(),
            factory,
            capacity,
            available_tx,
            available_rx: Mutex::new(available_rx),
            live: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        });

        pool.add_instance().await?;

        let prewarm = config.prewarm.clamp(1, capacity);
        for _ in 1..prewarm {
            Arc::clone(&pool).spawn_replacement();
        }

        info!(pool = %pool.name, prewarm, "Instance pool created");
        Ok(pool)
    }

    /// Name of this pool (the canonical FQMN of its module).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum live instances.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity,
            live: self.live.load(Ordering::Acquire),
            available: self.available_tx.max_capacity() - self.available_tx.capacity(),
        }
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has begun.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Take an idle instance, growing the pool if below capacity, otherwise
    /// waiting up to `deadline` for one to be released.
    pub async fn acquire(self: &Arc<Self>, deadline: Duration) -> Result<PooledInstance, FabricError> {
        if self.is_closed() {
            return Err(self.shut_down());
        }

        let instance = tokio::time::timeout(deadline, self.take())
            .await
            .map_err(|_| {
                FabricError::timeout(
                    format!("acquire instance of {}", self.name),
                    u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                )
            })??;

        Ok(PooledInstance {
            instance: Some(instance),
            pool: Arc::clone(self),
            outcome: Outcome::Discard,
        })
    }

    /// Parked takers give up the idle queue as soon as the pool closes.
    async fn take(&self) -> Result<Instance, FabricError> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(self.shut_down()),
            taken = self.take_open() => taken,
        }
    }

    async fn take_open(&self) -> Result<Instance, FabricError> {
        let mut rx = self.available_rx.lock().await;
        if let Ok(instance) = rx.try_recv() {
            return Ok(instance);
        }

        if self.try_reserve() {
            drop(rx);
            return self.create_reserved().await;
        }

        rx.recv().await.ok_or_else(|| self.shut_down())
    }

    fn shut_down(&self) -> FabricError {
        FabricError::canceled(format!("pool {} is shut down", self.name))
    }

    /// Instantiate one more idle instance.
    ///
    /// Fails with `Invariant` if the pool is already at capacity.
    pub async fn add_instance(&self) -> Result<(), FabricError> {
        if !self.try_reserve() {
            return Err(FabricError::invariant(format!(
                "pool {} is at capacity {}",
                self.name, self.capacity
            )));
        }
        let instance = self.create_reserved().await?;
        self.put_back(instance);
        Ok(())
    }

    /// Drop one idle instance. Returns `false` if none was idle.
    pub async fn remove_instance(&self) -> bool {
        let mut rx = self.available_rx.lock().await;
        match rx.try_recv() {
            Ok(instance) => {
                self.release_slot();
                debug!(pool = %self.name, instance_id = instance.id(), "Instance removed");
                true
            }
            Err(_) => false,
        }
    }

    /// Close the pool and drop every instance, waiting up to `deadline` for
    /// in-flight instances to come back.
    ///
    /// Returns the number of instances still live when the deadline elapsed.
    #[instrument(skip(self), fields(pool = %self.name))]
    pub async fn shutdown(&self, deadline: Duration) -> usize {
        self.closed.cancel();

        let drained = tokio::time::timeout(deadline, async {
            loop {
                {
                    let mut rx = self.available_rx.lock().await;
                    while rx.try_recv().is_ok() {
                        self.release_slot();
                    }
                }
                if self.live.load(Ordering::Acquire) == 0 {
                    break;
                }
                tokio::time::sleep(SHUTDOWN_POLL).await;
            }
        })
        .await;

        let residual = self.live.load(Ordering::Acquire);
        if let Ok(mut rx) = self.available_rx.try_lock() {
            rx.close();
        }
        if drained.is_err() || residual > 0 {
            warn!(residual, "Pool shut down with instances still live");
        } else {
            info!("Pool shut down");
        }
        residual
    }

    fn try_reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.capacity).then_some(live + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }

    async fn create_reserved(&self) -> Result<Instance, FabricError> {
        let slot = Reservation {
            pool: self,
            armed: true,
        };
        match self.factory.instantiate().await {
            Ok(instance) => {
                slot.commit();
                Ok(instance)
            }
            Err(e) => {
                warn!(pool = %self.name, error = %e, "Instantiation failed");
                Err(e)
            }
        }
    }

    fn put_back(&self, instance: Instance) {
        if self.is_closed() {
            self.release_slot();
            return;
        }
        if let Err(e) = self.available_tx.try_send(instance) {
            debug!(pool = %self.name, error = %e, "Idle queue refused instance");
            self.release_slot();
        }
    }

    /// Instantiate a replacement in the background.
    fn spawn_replacement(self: Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(pool = %self.name, "No runtime to instantiate a replacement on");
            return;
        };
        handle.spawn(async move {
            if self.is_closed() {
                return;
            }
            if let Err(e) = self.add_instance().await {
                debug!(pool = %self.name, error = %e, "Replacement not created");
            }
        });
    }
}

/// A reserved slot, released on drop unless committed.
///
/// Covers instantiation futures dropped by an acquire timeout.
struct Reservation<'a> {
    pool: &'a InstancePool,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release_slot();
        }
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// An instance checked out of a pool.
///
/// Dropping it discards the instance unless [`release`](Self::release) was
/// called, so an instance abandoned mid-call is never reused.
pub struct PooledInstance {
    instance: Option<Instance>,
    pool: Arc<InstancePool>,
    outcome: Outcome,
}

impl PooledInstance {
    /// Return the instance to the pool.
    pub fn release(mut self) {
        self.outcome = Outcome::ReturnToPool;
    }

    /// Discard the instance and schedule a replacement.
    pub fn discard(mut self) {
        self.outcome = Outcome::Discard;
    }

    /// Return or discard depending on `outcome`.
    pub fn finish(mut self, outcome: Outcome) {
        self.outcome = outcome;
    }

    /// The pool this instance belongs to.
    pub fn pool(&self) -> &Arc<InstancePool> {
        &self.pool
    }
}

impl Deref for PooledInstance {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        self.instance
            .as_ref()
            .unwrap_or_else(|| unreachable!("instance taken before drop"))
    }
}

impl DerefMut for PooledInstance {
    fn deref_mut(&mut self) -> &mut Instance {
        self.instance
            .as_mut()
            .unwrap_or_else(|| unreachable!("instance taken before drop"))
    }
}

impl Drop for PooledInstance {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };
        match self.outcome {
            Outcome::ReturnToPool => self.pool.put_back(instance),
            Outcome::Discard => {
                debug!(pool = %self.pool.name, instance_id = instance.id(), "Instance discarded");
                drop(instance);
                self.pool.release_slot();
                if !self.pool.is_closed() {
                    Arc::clone(&self.pool).spawn_replacement();
                }
            }
        }
    }
}

impl std::fmt::Debug for PooledInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledInstance")
            .field("instance", &self.instance)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}
