//! Wasmtime engine configuration and creation.
//!
//! The [`WasmEngine`] is the foundation of the fabric. It is:
//! - Thread-safe and shared across every pool
//! - Configured with pooling allocator for fast instantiation
//! - Set up with fuel metering and epoch interruption for resource limiting
//!
//! When epoch interruption is enabled the engine owns a background ticker
//! thread that increments the epoch every `epoch_tick_ms`. Stores yield to the
//! async executor on every tick, which is what lets a `tokio::time::timeout`
//! around a guest call actually fire.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{debug, info, warn};
use wasmtime::{Config, Engine, InstanceAllocationStrategy, PoolingAllocationConfig};

use fabric_common::{EngineConfig, FabricError};

/// Thread-safe WebAssembly engine wrapper.
///
/// # Configuration
///
/// The engine is configured with:
/// - **Pooling Allocator**: Pre-allocates memory slots for instances
/// - **Fuel Metering**: Optional deterministic CPU limiting
/// - **Epoch Interruption**: Time-based yielding for per-call deadlines
/// - **Async Support**: Required by the host-function bridge
///
/// # Example
///
/// ```ignore
/// use fabric_common::EngineConfig;
/// use fabric_core::WasmEngine;
///
/// let config = EngineConfig::default();
/// let engine = WasmEngine::new(&config)?;
/// ```
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
    _ticker: Option<Arc<EpochTicker>>,
}

impl WasmEngine {
    /// Create a new WebAssembly engine with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The Wasmtime configuration is invalid
    /// - The pooling allocator cannot be initialized
    /// - The epoch ticker thread cannot be spawned
    pub fn new(config: &EngineConfig) -> Result<Self, FabricError> {
        let mut wasmtime_config = Config::new();

        wasmtime_config.async_support(true);
        wasmtime_config.consume_fuel(config.fuel_metering);

        if config.epoch_interruption {
            wasmtime_config.epoch_interruption(true);
        }

        wasmtime_config.cranelift_opt_level(wasmtime::OptLevel::Speed);

        if config.pooling_allocator {
            let pooling_config = Self::create_pooling_config(config);

            wasmtime_config
                .allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

            info!(
                max_instances = config.max_instances,
                instance_memory_mb = config.instance_memory_mb,
                "Pooling allocator enabled"
            );
        }

        let engine = Engine::new(&wasmtime_config).map_err(|e| {
            FabricError::invalid_config(format!("Failed to create Wasmtime engine: {e}"))
        })?;
        let engine = Arc::new(engine);

        let ticker = if config.epoch_interruption {
            Some(Arc::new(EpochTicker::start(
                Arc::clone(&engine),
                config.epoch_tick(),
            )?))
        } else {
            None
        };

        info!(
            epoch_interruption = config.epoch_interruption,
            fuel_metering = config.fuel_metering,
            "Wasmtime engine initialized"
        );

        Ok(Self {
            engine,
            config: config.clone(),
            _ticker: ticker,
        })
    }

    /// Create pooling allocation configuration.
    fn create_pooling_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut pooling = PoolingAllocationConfig::default();

        pooling.total_core_instances(config.max_instances);
        pooling.total_memories(config.max_instances);
        pooling.total_tables(config.max_instances);
        pooling.total_stacks(config.max_instances);

        let max_memory_bytes = (config.instance_memory_mb as usize) * 1024 * 1024;
        pooling.max_memory_size(max_memory_bytes);

        pooling
    }

    /// Get a reference to the inner Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Increment the epoch counter by hand.
    pub fn increment_epoch(&self) {
        self.engine.increment_epoch();
    }

    /// Check if the pooling allocator is enabled.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }

    /// Check if fuel metering is enabled.
    pub fn is_fuel_enabled(&self) -> bool {
        self.config.fuel_metering
    }

    /// Check if epoch interruption is enabled.
    pub fn is_epoch_enabled(&self) -> bool {
        self.config.epoch_interruption
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .field("epoch_interruption", &self.config.epoch_interruption)
            .field("fuel_metering", &self.config.fuel_metering)
            .finish_non_exhaustive()
    }
}

/// Background thread incrementing the engine epoch.
///
/// Stops once the last [`WasmEngine`] clone is dropped.
struct EpochTicker {
    stop: Arc<AtomicBool>,
}

impl EpochTicker {
    fn start(engine: Arc<Engine>, tick: std::time::Duration) -> Result<Self, FabricError> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        thread::Builder::new()
            .name("fabric-epoch".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(tick);
                    engine.increment_epoch();
                }
                debug!("Epoch ticker stopped");
            })
            .map_err(|e| {
                warn!(error = %e, "Failed to spawn epoch ticker");
                FabricError::invalid_config(format!("Failed to spawn epoch ticker: {e}"))
            })?;

        debug!(tick_ms = tick.as_millis(), "Epoch ticker started");
        Ok(Self { stop })
    }
}

impl Drop for EpochTicker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
