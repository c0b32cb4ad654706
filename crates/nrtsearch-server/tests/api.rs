//! HTTP API tests against in-process nodes

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use nrtsearch_core::testing::{
    TEST_INDEX, TestContext, TestNode, primary_config, replica_config, wait_for_version,
};
use nrtsearch_core::{IndexNode, VersionWaitPolicy};
use nrtsearch_protocol::{DocumentPayload, RestClient, SearchRequestBody};
use nrtsearch_server::{NodeServer, router};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn app(node: &Arc<IndexNode>) -> Router {
    router(Arc::new(NodeServer::new(node.clone())))
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn documents(range: std::ops::Range<usize>) -> Value {
    let docs: Vec<Value> = range
        .map(|i| json!({ "id": format!("doc-{}", i), "fields": { "body": format!("hello {}", i) } }))
        .collect();
    json!({ "documents": docs })
}

fn index_uri(op: &str) -> String {
    format!("/v1/indexes/{}/{}", TEST_INDEX, op)
}

#[tokio::test]
async fn test_health() {
    let ctx = TestContext::new();
    let node = IndexNode::open(primary_config(&ctx, "primary")).unwrap();
    let app = app(&node);

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["role"], "primary");
    assert_eq!(body["index_name"], TEST_INDEX);
    assert_eq!(body["active_version"], 0);

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_add_refresh_search() {
    let ctx = TestContext::new();
    let node = IndexNode::open(primary_config(&ctx, "primary")).unwrap();
    let app = app(&node);

    let (status, body) = call(&app, "POST", &index_uri("documents"), Some(documents(0..3))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], 3);
    assert_eq!(body["pending"], 3);

    // buffered documents are not visible before a refresh
    let (_, body) = call(&app, "POST", &index_uri("search"), Some(json!({ "query": "hello" }))).await;
    assert_eq!(body["total_hits"], 0);

    let (status, body) = call(&app, "POST", &index_uri("refresh"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], 1);

    let (status, body) = call(
        &app,
        "POST",
        &index_uri("search"),
        Some(json!({ "query": "hello", "retrieve_fields": ["body"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_hits"], 3);
    assert_eq!(body["version_served"], 1);
    assert!(body["hits"][0]["fields"]["body"].as_str().unwrap().starts_with("hello"));

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_huge_page_size_is_served() {
    let ctx = TestContext::new();
    let node = IndexNode::open(primary_config(&ctx, "primary")).unwrap();
    let app = app(&node);

    call(&app, "POST", &index_uri("documents"), Some(documents(0..2))).await;
    call(&app, "POST", &index_uri("refresh"), Some(json!({}))).await;

    let (status, body) = call(
        &app,
        "POST",
        &index_uri("search"),
        Some(json!({ "query": "*", "top_hits": u64::MAX })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_hits"], 2);
    assert_eq!(body["hits"].as_array().unwrap().len(), 2);

    // the node is still serving afterwards
    let (status, _) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_nrt_point_without_changes_keeps_version() {
    let ctx = TestContext::new();
    let node = IndexNode::open(primary_config(&ctx, "primary")).unwrap();
    let app = app(&node);

    call(&app, "POST", &index_uri("documents"), Some(documents(0..2))).await;
    let (_, first) = call(&app, "POST", &index_uri("nrt_point"), Some(json!({}))).await;
    assert_eq!(first["version"], 1);
    assert_eq!(first["did_refresh"], true);

    let (status, second) = call(&app, "POST", &index_uri("nrt_point"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["version"], 1);
    assert_eq!(second["did_refresh"], false);

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_index_is_404() {
    let ctx = TestContext::new();
    let node = IndexNode::open(primary_config(&ctx, "primary")).unwrap();
    let app = app(&node);

    let (status, body) = call(
        &app,
        "POST",
        "/v1/indexes/missing/search",
        Some(json!({ "query": "*" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "INDEX_NOT_FOUND");
    assert_eq!(body["success"], false);

    let (status, _) = call(&app, "GET", "/v1/indexes/missing/replication", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_future_version_with_fail_policy_is_503() {
    let ctx = TestContext::new();
    let config = primary_config(&ctx, "primary").with_wait_policy(VersionWaitPolicy::Fail);
    let node = IndexNode::open(config).unwrap();
    let app = app(&node);

    let (status, body) = call(
        &app,
        "POST",
        &index_uri("search"),
        Some(json!({ "query": "*", "version": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "VERSION_NOT_AVAILABLE");

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_replica_rejects_writes() {
    let ctx = TestContext::new();
    let unreachable = "127.0.0.1:1".parse().unwrap();
    let node = IndexNode::open(replica_config(&ctx, "replica", unreachable)).unwrap();
    let app = app(&node);

    let (status, body) = call(&app, "POST", &index_uri("documents"), Some(documents(0..1))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ROLE_MISMATCH");

    let (status, _) = call(&app, "POST", &index_uri("nrt_point"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // search still answers from the restored state
    let (status, body) = call(&app, "POST", &index_uri("search"), Some(json!({ "query": "*" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version_served"], 0);

    let (status, body) = call(&app, "GET", &index_uri("replication"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "replica");
    assert_eq!(body["sync_state"], "disconnected");

    node.close().await.unwrap();
}

#[tokio::test]
async fn test_sync_on_primary_is_409() {
    let ctx = TestContext::new();
    let node = IndexNode::open(primary_config(&ctx, "primary")).unwrap();
    let app = app(&node);

    let (status, body) = call(&app, "POST", &index_uri("sync"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ROLE_MISMATCH");

    node.close().await.unwrap();
}

async fn serve(node: &Arc<IndexNode>) -> RestClient {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = app(node);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    RestClient::new(format!("http://{}", addr))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_your_writes_across_nodes() {
    let ctx = TestContext::new();
    let primary = TestNode::start(primary_config(&ctx, "primary")).await.unwrap();
    let replica = TestNode::start(replica_config(&ctx, "replica", primary.replication_addr()))
        .await
        .unwrap();
    let primary_api = serve(&primary.node).await;
    let replica_api = serve(&replica.node).await;

    let docs = (0..4)
        .map(|i| DocumentPayload::new(format!("doc-{}", i)).with_field("body", "shared text"))
        .collect();
    primary_api.add_documents(TEST_INDEX, docs).await.unwrap();
    let written = primary_api.write_nrt_point(TEST_INDEX).await.unwrap();
    assert_eq!(written.version, 1);

    // pinned search on the replica waits until the version arrives
    let result = replica_api
        .search(TEST_INDEX, &SearchRequestBody::new("shared").at_version(written.version))
        .await
        .unwrap();
    assert!(result.version_served >= written.version);
    assert_eq!(result.total_hits, 4);

    assert!(wait_for_version(&replica.node, 1, Duration::from_secs(5)).await);
    let status = replica_api.replication_status(TEST_INDEX).await.unwrap();
    assert_eq!(status.active_version, 1);
    assert_eq!(status.sync_state.as_deref(), Some("active"));

    let sync = replica_api.sync(TEST_INDEX).await.unwrap();
    assert_eq!(sync.version, 1);
    assert!(!sync.activated);

    let err = replica_api
        .add_documents(TEST_INDEX, vec![DocumentPayload::new("x")])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some("ROLE_MISMATCH"));

    replica.shutdown().await.unwrap();
    primary.shutdown().await.unwrap();
}
