//! Primary/replica replication over loopback TCP

use nrtsearch_core::replication::PrimaryConnection;
use nrtsearch_core::replication::protocol::error_code;
use nrtsearch_core::testing::{
    TEST_INDEX, TestContext, TestNode, primary_config, replica_config, sample_documents,
    wait_for_version,
};
use nrtsearch_core::{Error, IndexNode, SearchRequest, SyncOutcome, SyncState};
use std::time::Duration;

const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

async fn total_hits(node: &IndexNode, version: Option<u64>) -> u64 {
    let mut request = SearchRequest::new(TEST_INDEX, "*").page(0, 100);
    request.version = version;
    node.search(request).await.unwrap().total_hits
}

async fn hit_ids(node: &IndexNode, version: u64) -> Vec<String> {
    let request = SearchRequest::new(TEST_INDEX, "sample").at_version(version).page(0, 100);
    let response = node.search(request).await.unwrap();
    assert_eq!(response.version_served, version);
    response.hits.into_iter().map(|h| h.id).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_restart_scenario() {
    let ctx = TestContext::new();
    let primary = TestNode::start(primary_config(&ctx, "primary")).await.unwrap();
    let replica = TestNode::start(replica_config(&ctx, "replica", primary.replication_addr()))
        .await
        .unwrap();

    primary.node.add_documents(TEST_INDEX, sample_documents(0..2)).unwrap();
    let first = primary.node.write_nrt_point(TEST_INDEX).await.unwrap();
    assert!(first.did_refresh);
    assert!(wait_for_version(&replica.node, first.version, SYNC_TIMEOUT).await);
    assert_eq!(total_hits(&replica.node, None).await, 2);

    replica.shutdown().await.unwrap();

    primary.node.add_documents(TEST_INDEX, sample_documents(2..4)).unwrap();
    let second = primary.node.write_nrt_point(TEST_INDEX).await.unwrap();
    assert!(second.did_refresh);
    assert_eq!(total_hits(&primary.node, None).await, 4);

    let replica = TestNode::start(replica_config(&ctx, "replica", primary.replication_addr()))
        .await
        .unwrap();
    assert!(replica.node.current_version() >= first.version);
    assert!(wait_for_version(&replica.node, second.version, SYNC_TIMEOUT).await);
    assert_eq!(total_hits(&replica.node, None).await, 4);

    primary.node.add_documents(TEST_INDEX, sample_documents(4..6)).unwrap();
    let third = primary.node.write_nrt_point(TEST_INDEX).await.unwrap();
    assert!(third.did_refresh);
    assert!(third.version > second.version);

    assert_eq!(total_hits(&primary.node, Some(third.version)).await, 6);
    // pinned search waits for the replica to reach the version
    assert_eq!(total_hits(&replica.node, Some(third.version)).await, 6);
    assert_eq!(
        hit_ids(&primary.node, third.version).await,
        hit_ids(&replica.node, third.version).await
    );

    let stats = replica.node.status().client.unwrap();
    assert!(stats.files_reused > 0 || stats.files_fetched > 0);

    replica.shutdown().await.unwrap();
    primary.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_convergence_after_reconnect_with_merges() {
    let ctx = TestContext::new();
    let primary = TestNode::start(primary_config(&ctx, "primary").with_max_segments(2))
        .await
        .unwrap();
    let replica = TestNode::start(replica_config(&ctx, "replica", primary.replication_addr()))
        .await
        .unwrap();

    primary.node.add_documents(TEST_INDEX, sample_documents(0..3)).unwrap();
    let first = primary.node.write_nrt_point(TEST_INDEX).await.unwrap();
    assert!(wait_for_version(&replica.node, first.version, SYNC_TIMEOUT).await);
    replica.shutdown().await.unwrap();

    let mut latest = first.version;
    for batch in 1..6 {
        primary
            .node
            .add_documents(TEST_INDEX, sample_documents(batch * 3..batch * 3 + 3))
            .unwrap();
        latest = primary.node.write_nrt_point(TEST_INDEX).await.unwrap().version;
    }

    let replica = TestNode::start(replica_config(&ctx, "replica", primary.replication_addr()))
        .await
        .unwrap();
    let outcome = replica.node.sync_now(TEST_INDEX).await.unwrap();
    assert_eq!(outcome.version(), latest);
    assert_eq!(replica.node.current_version(), latest);
    assert_eq!(total_hits(&replica.node, None).await, 18);
    assert_eq!(
        hit_ids(&primary.node, latest).await,
        hit_ids(&replica.node, latest).await
    );

    // superseded segments are gone, only the active manifest remains
    let served = primary.node.get_segment_files(TEST_INDEX, None).unwrap();
    let mut expected: Vec<String> = served
        .point()
        .manifest
        .files()
        .iter()
        .map(|f| f.name.clone())
        .collect();
    let mut local = replica.node.engine().list_segments().unwrap();
    expected.sort();
    local.sort();
    assert_eq!(local, expected);
    drop(served);

    replica.shutdown().await.unwrap();
    primary.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sync_when_up_to_date() {
    let ctx = TestContext::new();
    let primary = TestNode::start(primary_config(&ctx, "primary")).await.unwrap();
    let replica = TestNode::start(replica_config(&ctx, "replica", primary.replication_addr()))
        .await
        .unwrap();

    primary.node.add_documents(TEST_INDEX, sample_documents(0..4)).unwrap();
    let published = primary.node.write_nrt_point(TEST_INDEX).await.unwrap();
    assert!(wait_for_version(&replica.node, published.version, SYNC_TIMEOUT).await);

    let outcome = replica.node.sync_now(TEST_INDEX).await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::UpToDate {
            version: published.version
        }
    );
    assert_eq!(replica.node.refresh(TEST_INDEX).await.unwrap(), published.version);

    replica.shutdown().await.unwrap();
    primary.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_nrt_point_over_replication_endpoint() {
    let ctx = TestContext::new();
    let primary = TestNode::start(primary_config(&ctx, "primary")).await.unwrap();
    primary.node.add_documents(TEST_INDEX, sample_documents(0..2)).unwrap();

    let mut connection = PrimaryConnection::connect(
        primary.replication_addr(),
        "operator",
        TEST_INDEX,
        Duration::from_secs(2),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert!(connection.peer_is_primary());
    assert_eq!(connection.peer_version(), 0);

    let first = connection.write_nrt_point(TEST_INDEX).await.unwrap();
    assert!(first.did_refresh);
    assert_eq!(first.version, 1);

    let again = connection.write_nrt_point(TEST_INDEX).await.unwrap();
    assert!(!again.did_refresh);
    assert_eq!(again.version, 1);

    assert_eq!(connection.latest_point().await.unwrap().version, 1);
    connection.ping().await.unwrap();

    match connection.write_nrt_point("missing").await {
        Err(Error::Remote { code, .. }) => assert_eq!(code, error_code::INDEX_NOT_FOUND),
        other => panic!("expected remote error, got {:?}", other),
    }

    primary.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transfer_lease_released_without_fetch() {
    let ctx = TestContext::new();
    let primary = TestNode::start(primary_config(&ctx, "primary")).await.unwrap();
    primary.node.add_documents(TEST_INDEX, sample_documents(0..2)).unwrap();
    let published = primary.node.write_nrt_point(TEST_INDEX).await.unwrap();
    let store = primary.node.publisher("test").unwrap().store().clone();

    let mut connection = PrimaryConnection::connect(
        primary.replication_addr(),
        "replica",
        TEST_INDEX,
        Duration::from_secs(2),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    // nothing to send, so nothing stays pinned
    let header = connection.get_segment_files(Some(published.version)).await.unwrap();
    assert!(header.delta.added.is_empty());
    assert_eq!(store.lease_count(published.version), 0);

    // a plan with files is leased until the replica moves on
    let header = connection.get_segment_files(Some(0)).await.unwrap();
    assert!(!header.delta.added.is_empty());
    assert_eq!(store.lease_count(published.version), 1);

    connection.latest_point().await.unwrap();
    assert_eq!(store.lease_count(published.version), 0);

    drop(connection);
    primary.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_endpoint_rejects_writes() {
    let ctx = TestContext::new();
    let primary = TestNode::start(primary_config(&ctx, "primary")).await.unwrap();
    let replica = TestNode::start(replica_config(&ctx, "replica", primary.replication_addr()))
        .await
        .unwrap();

    let mut connection = PrimaryConnection::connect(
        replica.replication_addr(),
        "operator",
        TEST_INDEX,
        Duration::from_secs(2),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert!(!connection.peer_is_primary());
    assert_eq!(connection.peer_name(), "replica");

    match connection.write_nrt_point(TEST_INDEX).await {
        Err(Error::Remote { code, .. }) => assert_eq!(code, error_code::ROLE_MISMATCH),
        other => panic!("expected role mismatch, got {:?}", other),
    }
    match connection.latest_point().await {
        Err(Error::Remote { code, .. }) => assert_eq!(code, error_code::ROLE_MISMATCH),
        other => panic!("expected role mismatch, got {:?}", other),
    }
    // the connection survives rejected requests
    connection.ping().await.unwrap();

    assert!(matches!(
        replica.node.add_documents(TEST_INDEX, sample_documents(0..1)),
        Err(Error::RoleMismatch { .. })
    ));

    replica.shutdown().await.unwrap();
    primary.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handshake_rejects_unknown_index() {
    let ctx = TestContext::new();
    let primary = TestNode::start(primary_config(&ctx, "primary")).await.unwrap();

    let result = PrimaryConnection::connect(
        primary.replication_addr(),
        "stranger",
        "other_index",
        Duration::from_secs(2),
        Duration::from_secs(5),
    )
    .await;
    match result {
        Err(Error::Remote { code, .. }) => assert_eq!(code, error_code::INDEX_NOT_FOUND),
        Err(other) => panic!("expected remote error, got {}", other),
        Ok(_) => panic!("handshake for an unknown index succeeded"),
    }

    primary.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replica_without_primary_serves_restored_state() {
    let ctx = TestContext::new();
    let primary = TestNode::start(primary_config(&ctx, "primary")).await.unwrap();
    let replica = TestNode::start(replica_config(&ctx, "replica", primary.replication_addr()))
        .await
        .unwrap();

    primary.node.add_documents(TEST_INDEX, sample_documents(0..3)).unwrap();
    let published = primary.node.write_nrt_point(TEST_INDEX).await.unwrap();
    assert!(wait_for_version(&replica.node, published.version, SYNC_TIMEOUT).await);

    let primary_addr = primary.replication_addr();
    replica.shutdown().await.unwrap();
    primary.shutdown().await.unwrap();

    let replica = TestNode::start(replica_config(&ctx, "replica", primary_addr)).await.unwrap();
    assert_eq!(replica.node.current_version(), published.version);
    assert_eq!(total_hits(&replica.node, None).await, 3);
    assert!(replica.node.sync_now(TEST_INDEX).await.is_err());
    assert_eq!(replica.node.current_version(), published.version);

    replica.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_syncs_are_coalesced() {
    let ctx = TestContext::new();
    let primary = TestNode::start(primary_config(&ctx, "primary")).await.unwrap();
    primary.node.add_documents(TEST_INDEX, sample_documents(0..3)).unwrap();
    let published = primary.node.write_nrt_point(TEST_INDEX).await.unwrap();

    // no background loop, so only these two calls drive the client
    let replica = IndexNode::open(replica_config(&ctx, "replica", primary.replication_addr())).unwrap();
    let (first, second) = tokio::join!(
        replica.sync_now(TEST_INDEX),
        replica.sync_now(TEST_INDEX)
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert!(matches!(first, SyncOutcome::Activated { version, .. } if version == published.version));
    assert_eq!(first, second);

    let stats = replica.status().client.unwrap();
    assert_eq!(stats.syncs, 1);
    assert_eq!(stats.activations, 1);
    assert_eq!(replica.current_version(), published.version);

    replica.close().await.unwrap();
    primary.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stalled_primary_times_out_to_disconnected() {
    let ctx = TestContext::new();
    // accepts connections (kernel backlog) but never answers
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();

    let mut config = replica_config(&ctx, "replica", silent_addr);
    config.replication.read_timeout = Duration::from_millis(300);
    let replica = IndexNode::open(config).unwrap();

    let started = std::time::Instant::now();
    let (first, shared) = tokio::join!(
        replica.sync_now(TEST_INDEX),
        replica.sync_now(TEST_INDEX)
    );
    assert!(matches!(first, Err(Error::Timeout(_))), "got {:?}", first);
    // the waiter sees the same kind of failure, not a generic one
    assert!(matches!(shared, Err(Error::Timeout(_))), "got {:?}", shared);
    assert!(started.elapsed() < Duration::from_secs(5));

    let status = replica.status();
    assert_eq!(status.sync_state, Some(SyncState::Disconnected));
    assert_eq!(status.active_version, 0);
    assert_eq!(status.client.unwrap().failed_syncs, 1);

    replica.close().await.unwrap();
    drop(silent);
}
