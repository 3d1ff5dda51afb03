//! Integration tests for fabric-core.
//!
//! These tests drive real WAT guests through the full call pipeline:
//! - Instance creation with `_start`/`init`
//! - Identifier binding and the result/error channels
//! - Traps, timeouts and instance discard
//! - Pool capacity and pool sharing

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use fabric_common::{
    CoordinatedRequest, EngineConfig, ErrorKind, ExecutionConfig, FabricError, PoolConfig,
};
use fabric_core::{
    CompiledModule, HostCall, HostRegistry, IdentifierRegistry, Instance, InstanceFactory,
    InstancePool, ModuleRef, PoolSet, Returns, WasmEngine, reject,
};

// ============================================================================
// Guests
// ============================================================================

const PRELUDE: &str = r#"
    (import "env" "return_result" (func $return_result (param i32 i32 i32)))
    (import "env" "return_error" (func $return_error (param i32 i32 i32 i32)))
    (memory (export "memory") 1)
    (global $heap (mut i32) (i32.const 4096))
    (func (export "allocate") (param $len i32) (result i32)
        (local $ptr i32)
        (local.set $ptr (global.get $heap))
        (global.set $heap (i32.add (global.get $heap) (local.get $len)))
        (local.get $ptr))
    (func (export "deallocate") (param i32 i32))
"#;

fn guest(body: &str) -> String {
    format!("(module {PRELUDE} {body})")
}

fn echo() -> String {
    guest(
        r#"(func (export "run_e") (param $ptr i32) (param $len i32) (param $ident i32) (result i32)
            (call $return_result (local.get $ptr) (local.get $len) (local.get $ident))
            (i32.const 0))"#,
    )
}

fn teapot() -> String {
    guest(
        r#"(data (i32.const 0) "teapot")
        (func (export "run_e") (param $ptr i32) (param $len i32) (param $ident i32) (result i32)
            (call $return_error (i32.const 418) (i32.const 0) (i32.const 6) (local.get $ident))
            (i32.const 0))"#,
    )
}

fn silent() -> String {
    guest(
        r#"(func (export "run_e") (param i32 i32 i32) (result i32)
            (i32.const 0))"#,
    )
}

fn trapping() -> String {
    guest(
        r#"(func (export "run_e") (param i32 i32 i32) (result i32)
            unreachable)"#,
    )
}

fn spinning() -> String {
    guest(
        r#"(func (export "run_e") (param i32 i32 i32) (result i32)
            (loop $forever (br $forever))
            (i32.const 0))"#,
    )
}

fn publishes_twice() -> String {
    guest(
        r#"(data (i32.const 0) "firstsecond")
        (func (export "run_e") (param $ptr i32) (param $len i32) (param $ident i32) (result i32)
            (call $return_result (i32.const 0) (i32.const 5) (local.get $ident))
            (call $return_result (i32.const 5) (i32.const 6) (local.get $ident))
            (call $return_error (i32.const 500) (i32.const 0) (i32.const 5) (local.get $ident))
            (i32.const 0))"#,
    )
}

fn with_init() -> String {
    guest(
        r#"(global $greeting (mut i32) (i32.const 0))
        (data (i32.const 0) "cold warm")
        (func (export "init") (global.set $greeting (i32.const 5)))
        (func (export "run_e") (param $ptr i32) (param $len i32) (param $ident i32) (result i32)
            (call $return_result (global.get $greeting) (i32.const 4) (local.get $ident))
            (i32.const 0))"#,
    )
}

// ============================================================================
// Host functions used by the guests
// ============================================================================

fn return_result(mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let (ptr, len, ident) = (call.arg(0), call.arg(1), call.ident());
        let ctx = match call.context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("return_result", ident, &e),
        };
        match call.read_memory(ptr, len) {
            Ok(bytes) => {
                ctx.lock().send_result(bytes);
                0
            }
            Err(e) => reject("return_result", ident, &e),
        }
    })
}

fn return_error(mut call: HostCall<'_>) -> BoxFuture<'_, i32> {
    Box::pin(async move {
        let (code, ptr, len, ident) = (call.arg(0), call.arg(1), call.arg(2), call.ident());
        let ctx = match call.context() {
            Ok(ctx) => ctx,
            Err(e) => return reject("return_error", ident, &e),
        };
        let message = call.read_string(ptr, len).unwrap_or_default();
        ctx.lock()
            .send_error(fabric_common::RunError::new(code, message));
        0
    })
}

fn registry() -> HostRegistry {
    let mut registry = HostRegistry::new();
    registry.register("return_result", 3, Returns::Void, return_result);
    registry.register("return_error", 4, Returns::Void, return_error);
    registry
}

// ============================================================================
// Fixtures
// ============================================================================

struct Fixture {
    engine: WasmEngine,
    linker: Arc<wasmtime::Linker<fabric_core::InstanceState>>,
    idents: Arc<IdentifierRegistry>,
}

impl Fixture {
    fn new(epochs: bool) -> Self {
        let engine = WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            epoch_interruption: epochs,
            epoch_tick_ms: 5,
            ..Default::default()
        })
        .unwrap();
        let linker = Arc::new(registry().build_linker(&engine).unwrap());
        Self {
            engine,
            linker,
            idents: Arc::new(IdentifierRegistry::new()),
        }
    }

    fn compile(&self, wat: &str) -> CompiledModule {
        CompiledModule::from_wat(self.engine.inner(), wat).unwrap()
    }

    async fn instance(&self, wat: &str) -> Instance {
        Instance::new(
            &self.engine,
            &self.compile(wat),
            &self.linker,
            Arc::clone(&self.idents),
            &ExecutionConfig::default(),
        )
        .await
        .unwrap()
    }

    fn factory(&self, wat: &str) -> InstanceFactory {
        InstanceFactory::new(
            self.engine.clone(),
            self.compile(wat),
            Arc::clone(&self.linker),
            Arc::clone(&self.idents),
            ExecutionConfig::default(),
        )
    }
}

fn request(body: &[u8]) -> CoordinatedRequest {
    CoordinatedRequest::new("POST", "/name/t1/default/echo", body.to_vec())
}

const FQMN: &str = "fqmn://t1/default/echo@abc";
const DEADLINE: Duration = Duration::from_secs(5);

// ============================================================================
// Test: Instance calls
// ============================================================================

#[tokio::test]
async fn test_echo_round_trip() {
    let fx = Fixture::new(false);
    let mut instance = fx.instance(&echo()).await;

    let outcome = instance
        .execute(FQMN, request(b"hello"), CancellationToken::new(), DEADLINE)
        .await;

    assert_eq!(outcome.result.unwrap(), b"hello");
    assert!(outcome.reusable);
    assert!(fx.idents.is_empty());
}

#[tokio::test]
async fn test_instance_is_reusable_across_calls() {
    let fx = Fixture::new(false);
    let mut instance = fx.instance(&echo()).await;

    for body in [&b"one"[..], b"two", b"three"] {
        let outcome = instance
            .execute(FQMN, request(body), CancellationToken::new(), DEADLINE)
            .await;
        assert_eq!(outcome.result.unwrap(), body);
    }
    assert_eq!(fx.idents.count_for_instance(instance.id()), 0);
}

#[tokio::test]
async fn test_return_error_is_run_error() {
    let fx = Fixture::new(false);
    let mut instance = fx.instance(&teapot()).await;

    let outcome = instance
        .execute(FQMN, request(b""), CancellationToken::new(), DEADLINE)
        .await;

    match outcome.result.unwrap_err() {
        FabricError::Run(run) => {
            assert_eq!(run.code, 418);
            assert_eq!(run.message, "teapot");
        }
        other => panic!("expected run error, got {other:?}"),
    }
    assert!(outcome.reusable);
}

#[tokio::test]
async fn test_no_result_is_reported() {
    let fx = Fixture::new(false);
    let mut instance = fx.instance(&silent()).await;

    let outcome = instance
        .execute(FQMN, request(b"x"), CancellationToken::new(), DEADLINE)
        .await;

    let err = outcome.result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoResult);
    assert!(outcome.reusable);
}

#[tokio::test]
async fn test_only_first_publish_counts() {
    let fx = Fixture::new(false);
    let mut instance = fx.instance(&publishes_twice()).await;

    let outcome = instance
        .execute(FQMN, request(b""), CancellationToken::new(), DEADLINE)
        .await;

    assert_eq!(outcome.result.unwrap(), b"first");
}

#[tokio::test]
async fn test_trap_marks_instance_unusable() {
    let fx = Fixture::new(false);
    let mut instance = fx.instance(&trapping()).await;

    let outcome = instance
        .execute(FQMN, request(b""), CancellationToken::new(), DEADLINE)
        .await;

    assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Trap);
    assert!(!outcome.reusable);
    assert!(fx.idents.is_empty());
}

#[tokio::test]
async fn test_deadline_interrupts_spinning_guest() {
    let fx = Fixture::new(true);
    let mut instance = fx.instance(&spinning()).await;
    let cancel = CancellationToken::new();

    let outcome = instance
        .execute(
            FQMN,
            request(b""),
            cancel.clone(),
            Duration::from_millis(100),
        )
        .await;

    assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Timeout);
    assert!(!outcome.reusable);
    assert!(cancel.is_cancelled());
    assert!(fx.idents.is_empty());
}

#[tokio::test]
async fn test_cancel_interrupts_spinning_guest() {
    let fx = Fixture::new(true);
    let mut instance = fx.instance(&spinning()).await;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = instance.execute(FQMN, request(b""), cancel, DEADLINE).await;

    assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::Canceled);
    assert!(!outcome.reusable);
}

#[tokio::test]
async fn test_init_runs_once_at_creation() {
    let fx = Fixture::new(false);
    let mut instance = fx.instance(&with_init()).await;

    let outcome = instance
        .execute(FQMN, request(b""), CancellationToken::new(), DEADLINE)
        .await;

    assert_eq!(outcome.result.unwrap(), b"warm");
}

#[tokio::test]
async fn test_memory_round_trip() {
    let fx = Fixture::new(false);
    let mut instance = fx.instance(&echo()).await;

    let bytes = b"\x00\x01binary\xffpayload";
    let ptr = instance.write_memory(bytes).await.unwrap();
    let len = i32::try_from(bytes.len()).unwrap();

    assert_eq!(instance.read_memory(ptr, len), bytes);
    assert!(instance.read_memory(-1, 4).is_empty());
    assert!(instance.read_memory(0, i32::MAX).is_empty());
}

#[tokio::test]
async fn test_call_missing_export() {
    let fx = Fixture::new(false);
    let mut instance = fx.instance(&echo()).await;

    let err = instance.call("does_not_exist", &[]).await.unwrap_err();
    assert_eq!(
        err,
        fabric_core::CallError::ExportNotFound("does_not_exist".into())
    );
}

// ============================================================================
// Test: Pools
// ============================================================================

fn pool_config(capacity: usize, prewarm: usize) -> PoolConfig {
    PoolConfig {
        capacity,
        prewarm,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_pool_acquire_and_release() {
    let fx = Fixture::new(false);
    let pool = InstancePool::new(FQMN, fx.factory(&echo()), &pool_config(4, 1))
        .await
        .unwrap();

    let mut instance = pool.acquire(DEADLINE).await.unwrap();
    let id = instance.id();
    let outcome = instance
        .execute(FQMN, request(b"pooled"), CancellationToken::new(), DEADLINE)
        .await;
    assert_eq!(outcome.result.unwrap(), b"pooled");
    instance.release();

    let again = pool.acquire(DEADLINE).await.unwrap();
    assert_eq!(again.id(), id);
}

#[tokio::test]
async fn test_pool_never_exceeds_capacity() {
    let fx = Fixture::new(false);
    let pool = InstancePool::new(FQMN, fx.factory(&echo()), &pool_config(2, 1))
        .await
        .unwrap();

    let a = pool.acquire(DEADLINE).await.unwrap();
    let b = pool.acquire(DEADLINE).await.unwrap();
    assert_eq!(pool.stats().live, 2);

    let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(pool.stats().live <= pool.capacity());

    a.release();
    let c = pool.acquire(DEADLINE).await.unwrap();
    assert!(pool.stats().live <= 2);
    drop((b, c));
}

#[tokio::test]
async fn test_waiter_receives_released_instance() {
    let fx = Fixture::new(false);
    let pool = InstancePool::new(FQMN, fx.factory(&echo()), &pool_config(1, 1))
        .await
        .unwrap();

    let held = pool.acquire(DEADLINE).await.unwrap();
    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(DEADLINE).await.map(|i| i.id()) })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    let id = held.id();
    held.release();

    assert_eq!(waiter.await.unwrap().unwrap(), id);
}

#[tokio::test]
async fn test_trapped_instance_is_replaced() {
    let fx = Fixture::new(false);
    let pool = InstancePool::new(FQMN, fx.factory(&trapping()), &pool_config(1, 1))
        .await
        .unwrap();

    let mut instance = pool.acquire(DEADLINE).await.unwrap();
    let first = instance.id();
    let outcome = instance
        .execute(FQMN, request(b""), CancellationToken::new(), DEADLINE)
        .await;
    assert!(!outcome.reusable);
    instance.discard();

    let replacement = pool.acquire(DEADLINE).await.unwrap();
    assert_ne!(replacement.id(), first);
    assert_eq!(pool.stats().live, 1);
}

#[tokio::test]
async fn test_dropped_guard_discards() {
    let fx = Fixture::new(false);
    let pool = InstancePool::new(FQMN, fx.factory(&echo()), &pool_config(1, 1))
        .await
        .unwrap();

    let first = {
        let instance = pool.acquire(DEADLINE).await.unwrap();
        instance.id()
    };

    let next = pool.acquire(DEADLINE).await.unwrap();
    assert_ne!(next.id(), first);
}

#[tokio::test]
async fn test_add_and_remove_instances() {
    let fx = Fixture::new(false);
    let pool = InstancePool::new(FQMN, fx.factory(&echo()), &pool_config(2, 1))
        .await
        .unwrap();

    pool.add_instance().await.unwrap();
    assert_eq!(pool.stats().live, 2);
    assert_eq!(
        pool.add_instance().await.unwrap_err().kind(),
        ErrorKind::Invariant
    );

    assert!(pool.remove_instance().await);
    assert_eq!(pool.stats().live, 1);
}

#[tokio::test]
async fn test_shutdown_drains_idle_instances() {
    let fx = Fixture::new(false);
    let pool = InstancePool::new(FQMN, fx.factory(&echo()), &pool_config(2, 1))
        .await
        .unwrap();

    assert_eq!(pool.shutdown(Duration::from_secs(1)).await, 0);
    assert!(pool.is_closed());
    assert_eq!(
        pool.acquire(DEADLINE).await.unwrap_err().kind(),
        ErrorKind::Canceled
    );
}

#[tokio::test]
async fn test_shutdown_reports_residual_instances() {
    let fx = Fixture::new(false);
    let pool = InstancePool::new(FQMN, fx.factory(&echo()), &pool_config(2, 1))
        .await
        .unwrap();

    let held = pool.acquire(DEADLINE).await.unwrap();
    assert_eq!(pool.shutdown(Duration::from_millis(50)).await, 1);
    drop(held);
    assert_eq!(pool.stats().live, 0);
}

#[tokio::test]
async fn test_shutdown_releases_parked_acquirer() {
    let fx = Fixture::new(false);
    let pool = InstancePool::new(FQMN, fx.factory(&echo()), &pool_config(1, 1))
        .await
        .unwrap();

    let held = pool.acquire(DEADLINE).await.unwrap();
    let parked = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire(Duration::from_secs(30)).await.map(|i| i.id()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = std::time::Instant::now();
    assert_eq!(pool.shutdown(Duration::from_millis(100)).await, 1);
    assert!(started.elapsed() < Duration::from_secs(2));

    let err = tokio::time::timeout(Duration::from_secs(1), parked)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    drop(held);
}

#[tokio::test]
async fn test_pool_set_shares_construction() {
    let fx = Fixture::new(false);
    let pools = Arc::new(PoolSet::new(
        fx.engine.clone(),
        registry().build_linker(&fx.engine).unwrap(),
        Arc::clone(&fx.idents),
        ExecutionConfig::default(),
        pool_config(4, 1),
    ));
    let module = ModuleRef::new("echo", wat::parse_str(echo()).unwrap());

    let (a, b) = tokio::join!(
        pools.get_or_create(FQMN, &module),
        pools.get_or_create(FQMN, &module)
    );

    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert_eq!(pools.len(), 1);
    assert!(pools.get(FQMN).is_some());
    assert!(pools.get("fqmn://t1/default/other@abc").is_none());
}

#[tokio::test]
async fn test_pool_set_does_not_remember_failures() {
    let fx = Fixture::new(false);
    let pools = PoolSet::new(
        fx.engine.clone(),
        registry().build_linker(&fx.engine).unwrap(),
        Arc::clone(&fx.idents),
        ExecutionConfig::default(),
        pool_config(4, 1),
    );
    let bad = ModuleRef::new("bad", b"\0asm\x01\0\0\0junk".to_vec());

    assert!(pools.get_or_create(FQMN, &bad).await.is_err());
    assert!(pools.is_empty());
    for i in 0..3 {
        let key = format!("fqmn://t1/default/bad{i}@abc");
        assert!(pools.get_or_create(&key, &bad).await.is_err());
    }
    assert_eq!(pools.len(), 0);

    let good = ModuleRef::new("echo", wat::parse_str(echo()).unwrap());
    assert!(pools.get_or_create(FQMN, &good).await.is_ok());
    assert_eq!(pools.shutdown(Duration::from_secs(1)).await, 0);
}
