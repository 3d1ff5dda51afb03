//! Host API tests driven by real WAT guests.
//!
//! Each guest imports the host functions it exercises from `env` and
//! publishes what it observed through `return_result`, so the assertions
//! only look at the call outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fabric_common::{
    CoordinatedRequest, DatabaseConfig, EngineConfig, ExecutionConfig, FabricError, NamedQuery,
    QueryType,
};
use fabric_core::{CallOutcome, CompiledModule, IdentifierRegistry, Instance, LogLevel, WasmEngine};
use fabric_host::{Capabilities, Database, host_registry};

// ============================================================================
// Guests
// ============================================================================

const PRELUDE: &str = r#"
    (import "env" "return_result" (func $return_result (param i32 i32 i32)))
    (import "env" "return_error" (func $return_error (param i32 i32 i32 i32)))
    (import "env" "return_abort" (func $return_abort (param i32 i32 i32 i32 i32 i32 i32)))
    (import "env" "return_result_swift" (func $return_result_swift (param i32 i32 i32 i32 i32)))
    (import "env" "get_ffi_result" (func $get_ffi_result (param i32 i32) (result i32)))
    (import "env" "add_ffi_var" (func $add_ffi_var (param i32 i32 i32 i32 i32) (result i32)))
    (import "env" "cache_set" (func $cache_set (param i32 i32 i32 i32 i32 i32) (result i32)))
    (import "env" "cache_get" (func $cache_get (param i32 i32 i32) (result i32)))
    (import "env" "request_get_field" (func $request_get_field (param i32 i32 i32 i32) (result i32)))
    (import "env" "resp_set_header" (func $resp_set_header (param i32 i32 i32 i32 i32)))
    (import "env" "log_msg" (func $log_msg (param i32 i32 i32 i32)))
    (import "env" "db_exec" (func $db_exec (param i32 i32 i32 i32) (result i32)))
    (import "env" "fetch_url" (func $fetch_url (param i32 i32 i32 i32 i32 i32) (result i32)))
    (memory (export "memory") 1)
    (global $heap (mut i32) (i32.const 4096))
    (func $allocate (export "allocate") (param $len i32) (result i32)
        (local $ptr i32)
        (local.set $ptr (global.get $heap))
        (global.set $heap (i32.add (global.get $heap) (local.get $len)))
        (local.get $ptr))
    (func (export "deallocate") (param i32 i32))

    ;; Copy the pending deferred result of size |n| into a fresh buffer.
    (func $take (param $n i32) (param $ident i32) (result i32)
        (local $buf i32)
        (if (i32.lt_s (local.get $n) (i32.const 0))
            (then (local.set $n (i32.sub (i32.const 0) (local.get $n)))))
        (local.set $buf (call $allocate (local.get $n)))
        (drop (call $get_ffi_result (local.get $buf) (local.get $ident)))
        (local.get $buf))

    (data (i32.const 0) "k")
    (data (i32.const 16) "method")
    (data (i32.const 32) "busy")
    (data (i32.const 48) "free")
    (data (i32.const 64) "hello")
    (data (i32.const 80) "X-A")
    (data (i32.const 88) "1")
    (data (i32.const 96) "2")
    (data (i32.const 112) "boom")
    (data (i32.const 128) "guest.ts")
    (data (i32.const 144) "missing")
    (data (i32.const 160) "name")
    (data (i32.const 176) "Ada")
    (data (i32.const 192) "users_named")
    (data (i32.const 208) "none")
"#;

fn guest(run_body: &str) -> String {
    format!(
        r#"(module {PRELUDE}
            (func (export "run_e") (param $ptr i32) (param $len i32) (param $ident i32) (result i32)
                (local $n i32)
                {run_body}
                (i32.const 0)))"#
    )
}

/// Stores the input under "k", reads it back and returns it.
fn cache_round_trip() -> String {
    guest(
        r"(drop (call $cache_set (i32.const 0) (i32.const 1)
                (local.get $ptr) (local.get $len) (i32.const 60) (local.get $ident)))
          (local.set $n (call $cache_get (i32.const 0) (i32.const 1) (local.get $ident)))
          (call $return_result
                (call $take (local.get $n) (local.get $ident)) (local.get $n) (local.get $ident))",
    )
}

/// Reads a key that was never set and reports the failure as a run error.
fn cache_miss() -> String {
    guest(
        r"(local.set $n (call $cache_get (i32.const 144) (i32.const 7) (local.get $ident)))
          (call $return_error (i32.const 404)
                (call $take (local.get $n) (local.get $ident))
                (i32.sub (i32.const 0) (local.get $n))
                (local.get $ident))",
    )
}

/// Returns the request method.
fn method_reader() -> String {
    guest(
        r"(local.set $n (call $request_get_field (i32.const 0) (i32.const 16) (i32.const 6) (local.get $ident)))
          (call $return_result
                (call $take (local.get $n) (local.get $ident)) (local.get $n) (local.get $ident))",
    )
}

/// Issues a second data call while the first result is still pending.
fn double_fetch() -> String {
    guest(
        r"(drop (call $request_get_field (i32.const 0) (i32.const 16) (i32.const 6) (local.get $ident)))
          (if (i32.eq
                (call $request_get_field (i32.const 0) (i32.const 16) (i32.const 6) (local.get $ident))
                (i32.const -1))
              (then (call $return_result (i32.const 32) (i32.const 4) (local.get $ident)))
              (else (call $return_result (i32.const 48) (i32.const 4) (local.get $ident))))",
    )
}

/// Calls `get_ffi_result` with nothing pending.
fn nothing_pending() -> String {
    guest(
        r"(if (i32.eq (call $get_ffi_result (i32.const 1024) (local.get $ident)) (i32.const -1))
              (then (call $return_result (i32.const 208) (i32.const 4) (local.get $ident)))
              (else (call $return_result (i32.const 48) (i32.const 4) (local.get $ident))))",
    )
}

fn logger() -> String {
    guest(
        r"(call $log_msg (i32.const 64) (i32.const 5) (i32.const 2) (local.get $ident))
          (call $return_result (i32.const 64) (i32.const 5) (local.get $ident))",
    )
}

fn header_setter() -> String {
    guest(
        r"(call $resp_set_header (i32.const 80) (i32.const 3) (i32.const 88) (i32.const 1) (local.get $ident))
          (call $resp_set_header (i32.const 80) (i32.const 3) (i32.const 96) (i32.const 1) (local.get $ident))
          (call $return_result (i32.const 64) (i32.const 5) (local.get $ident))",
    )
}

fn aborter() -> String {
    guest(
        r"(call $return_abort (i32.const 112) (i32.const 4) (i32.const 128) (i32.const 8)
                (i32.const 7) (i32.const 3) (local.get $ident))",
    )
}

fn swift_echo() -> String {
    guest(
        r"(call $return_result_swift (local.get $ptr) (local.get $len) (local.get $ident)
                (i32.const 0) (i32.const 0))",
    )
}

fn wrong_ident() -> String {
    guest(
        r"(call $return_result (local.get $ptr) (local.get $len)
                (i32.add (local.get $ident) (i32.const 1)))",
    )
}

/// Binds "Ada" as a variable and runs the `users_named` select.
fn db_select() -> String {
    guest(
        r"(drop (call $add_ffi_var (i32.const 160) (i32.const 4) (i32.const 176) (i32.const 3) (local.get $ident)))
          (local.set $n (call $db_exec (i32.const 3) (i32.const 192) (i32.const 11) (local.get $ident)))
          (call $return_result
                (call $take (local.get $n) (local.get $ident)) (local.get $n) (local.get $ident))",
    )
}

/// GETs the URL given as input.
fn fetcher() -> String {
    guest(
        r"(local.set $n (call $fetch_url (i32.const 0) (local.get $ptr) (local.get $len)
                (i32.const 0) (i32.const 0) (local.get $ident)))
          (if (i32.lt_s (local.get $n) (i32.const 0))
              (then (call $return_error (i32.const 502)
                    (call $take (local.get $n) (local.get $ident))
                    (i32.sub (i32.const 0) (local.get $n))
                    (local.get $ident)))
              (else (call $return_result
                    (call $take (local.get $n) (local.get $ident)) (local.get $n) (local.get $ident))))",
    )
}

// ============================================================================
// Fixture
// ============================================================================

const FQMN: &str = "fqmn://t1/default/probe@abc";
const DEADLINE: Duration = Duration::from_secs(5);

struct Fixture {
    engine: WasmEngine,
    linker: wasmtime::Linker<fabric_core::InstanceState>,
    idents: Arc<IdentifierRegistry>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_capabilities(&Capabilities::permissive().unwrap())
    }

    fn with_capabilities(capabilities: &Capabilities) -> Self {
        let engine = WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            epoch_interruption: false,
            ..Default::default()
        })
        .unwrap();
        let linker = host_registry(capabilities).build_linker(&engine).unwrap();
        Self {
            engine,
            linker,
            idents: Arc::new(IdentifierRegistry::new()),
        }
    }

    async fn run(&self, wat: &str, body: &[u8]) -> CallOutcome {
        let module = CompiledModule::from_wat(self.engine.inner(), wat).unwrap();
        let mut instance = Instance::new(
            &self.engine,
            &module,
            &self.linker,
            Arc::clone(&self.idents),
            &ExecutionConfig::default(),
        )
        .await
        .unwrap();
        instance
            .execute(
                FQMN,
                CoordinatedRequest::new("POST", "/name/t1/default/probe", body.to_vec()),
                CancellationToken::new(),
                DEADLINE,
            )
            .await
    }
}

fn run_error(outcome: CallOutcome) -> fabric_common::RunError {
    match outcome.result {
        Err(FabricError::Run(run)) => run,
        other => panic!("expected run error, got {other:?}"),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_deferred_result_round_trip_through_cache() {
    let outcome = Fixture::new().run(&cache_round_trip(), b"cached value").await;
    assert_eq!(outcome.result.unwrap(), b"cached value");
}

#[tokio::test]
async fn test_deferred_error_is_readable() {
    let run = run_error(Fixture::new().run(&cache_miss(), b"").await);
    assert_eq!(run.code, 404);
    assert_eq!(run.message, "key 'missing' not found");
}

#[tokio::test]
async fn test_request_field_is_visible() {
    let outcome = Fixture::new().run(&method_reader(), b"").await;
    assert_eq!(outcome.result.unwrap(), b"POST");
}

#[tokio::test]
async fn test_second_data_call_before_collecting_is_rejected() {
    let outcome = Fixture::new().run(&double_fetch(), b"").await;
    assert_eq!(outcome.result.unwrap(), b"busy");
}

#[tokio::test]
async fn test_get_ffi_result_without_pending_result() {
    let outcome = Fixture::new().run(&nothing_pending(), b"").await;
    assert_eq!(outcome.result.unwrap(), b"none");
}

#[tokio::test]
async fn test_log_entries_are_kept() {
    let outcome = Fixture::new().run(&logger(), b"").await;
    assert!(outcome.result.is_ok());
    assert_eq!(outcome.logs.len(), 1);
    assert_eq!(outcome.logs[0].level, LogLevel::Warn);
    assert_eq!(outcome.logs[0].message, "hello");
}

#[tokio::test]
async fn test_response_headers_append() {
    let outcome = Fixture::new().run(&header_setter(), b"").await;
    assert!(outcome.result.is_ok());
    assert_eq!(outcome.request.resp_headers.get_all("X-A"), ["1", "2"]);
}

#[tokio::test]
async fn test_abort_is_run_error() {
    let run = run_error(Fixture::new().run(&aborter(), b"").await);
    assert_eq!(run.code, -1);
    assert!(run.message.contains("boom"));
    assert!(run.message.contains("guest.ts:7:3"));
}

#[tokio::test]
async fn test_swift_variant_matches_canonical() {
    let outcome = Fixture::new().run(&swift_echo(), b"swift").await;
    assert_eq!(outcome.result.unwrap(), b"swift");
}

#[tokio::test]
async fn test_unknown_ident_publishes_nothing() {
    let outcome = Fixture::new().run(&wrong_ident(), b"lost").await;
    assert!(matches!(outcome.result, Err(FabricError::NoResult)));
}

#[tokio::test]
async fn test_db_exec_binds_ffi_vars() {
    let mut capabilities = Capabilities::permissive().unwrap();
    let database = Database::open(&DatabaseConfig {
        path: ":memory:".into(),
        queries: vec![NamedQuery {
            name: "users_named".into(),
            query_type: QueryType::Select,
            query: "SELECT name, age FROM users WHERE name = ?".into(),
        }],
    })
    .unwrap();
    database
        .execute_batch(
            "CREATE TABLE users (name TEXT, age INTEGER);
             INSERT INTO users VALUES ('Ada', 36), ('Bob', 12);",
        )
        .unwrap();
    capabilities.database = Some(database);

    let outcome = Fixture::with_capabilities(&capabilities)
        .run(&db_select(), b"")
        .await;
    let rows: serde_json::Value = serde_json::from_slice(&outcome.result.unwrap()).unwrap();
    assert_eq!(rows, serde_json::json!([{"name": "Ada", "age": 36}]));
}

#[tokio::test]
async fn test_fetch_url_from_guest() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/greeting"))
        .and(header("x-tenant", "t1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hi there"))
        .mount(&server)
        .await;

    let url = format!("{}/greeting::x-tenant:t1", server.uri());
    let outcome = Fixture::new().run(&fetcher(), url.as_bytes()).await;
    assert_eq!(outcome.result.unwrap(), b"hi there");
}

#[tokio::test]
async fn test_fetch_url_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&server)
        .await;

    let run = run_error(
        Fixture::new()
            .run(&fetcher(), format!("{}/x", server.uri()).as_bytes())
            .await,
    );
    assert_eq!(run.code, 502);
    assert_eq!(run.message, "503: down");
}
