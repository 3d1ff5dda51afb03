//! Authorizer cache behavior against a counting control plane.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fabric_common::{AuthConfig, ErrorKind, ManualClock};
use fabric_source::Authorizer;

fn config(server: &MockServer) -> AuthConfig {
    AuthConfig {
        enabled: true,
        control_plane: Some(server.uri()),
        ..Default::default()
    }
}

fn tenant_info() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "environment": "e",
        "tenant_id": "a",
        "name": "Tenant A"
    }))
}

async fn upstream_hits(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_requests_coalesce() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/environment/v1/tenant/e.a"))
        .respond_with(tenant_info().set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let auth = Arc::new(Authorizer::new(&config(&server)).unwrap());
    let mut tasks = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let auth = Arc::clone(&auth);
        tasks.push(tokio::spawn(async move {
            auth.authorize("t", "e.a", "ns", "m", &CancellationToken::new())
                .await
        }));
    }

    let mut infos = Vec::with_capacity(tasks.len());
    for task in tasks {
        infos.push(task.await.unwrap().unwrap());
    }

    assert_eq!(upstream_hits(&server).await, 1);
    assert!(infos.iter().all(|info| *info == infos[0]));
}

#[tokio::test]
async fn test_denials_are_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let auth = Authorizer::new(&config(&server)).unwrap();
    let cancel = CancellationToken::new();
    for _ in 0..3 {
        let err = auth
            .authorize("t", "e.a", "ns", "m", &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Access);
    }

    assert_eq!(upstream_hits(&server).await, 3);
}

#[tokio::test]
async fn test_entries_expire_after_ttl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(tenant_info())
        .mount(&server)
        .await;

    let clock = ManualClock::new();
    let config = config(&server);
    let auth = Authorizer::with_clock(&config, Arc::new(clock.clone())).unwrap();
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        auth.authorize("t", "e.a", "ns", "m", &cancel).await.unwrap();
    }
    assert_eq!(upstream_hits(&server).await, 1);

    clock.advance(config.ttl() + Duration::from_secs(1));
    for _ in 0..3 {
        auth.authorize("t", "e.a", "ns", "m", &cancel).await.unwrap();
    }
    assert_eq!(upstream_hits(&server).await, 2);
}

#[tokio::test]
async fn test_keys_include_module_and_credential() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(tenant_info())
        .mount(&server)
        .await;

    let auth = Authorizer::new(&config(&server)).unwrap();
    let cancel = CancellationToken::new();
    auth.authorize("t", "e.a", "ns", "m", &cancel).await.unwrap();
    auth.authorize("t", "e.a", "ns", "other", &cancel).await.unwrap();
    auth.authorize("t2", "e.a", "ns", "m", &cancel).await.unwrap();
    auth.authorize("t", "e.a", "ns", "m", &cancel).await.unwrap();

    assert_eq!(upstream_hits(&server).await, 3);
}

#[tokio::test]
async fn test_cancel_while_waiting() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(tenant_info().set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let auth = Authorizer::new(&config(&server)).unwrap();
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = auth
        .authorize("t", "e.a", "ns", "m", &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
}
