use std::time::Duration;

use assert_matches::assert_matches;

use crate::client::session_builder::SessionBuilder;
use crate::errors::QueryError;
use crate::statement::batch::{Batch, BatchType};
use crate::statement::query::Query;
use crate::utils::test_utils::mock_server::{MockNode, MockNodeOptions};
use crate::utils::test_utils::setup_tracing;
use basalt_cql::frame::value::SerializedValues;

fn builder_for(node: &MockNode) -> SessionBuilder {
    SessionBuilder::new()
        .known_node_addr(node.address())
        .keepalive_interval(None)
        .request_timeout(Some(Duration::from_secs(5)))
}

#[tokio::test]
async fn session_connects_and_serves_queries() {
    setup_tracing();
    let node = MockNode::start(MockNodeOptions::default()).await;

    let session = builder_for(&node).build().await.unwrap();

    let state = session.get_cluster_state();
    assert_eq!(state.cluster_name(), Some("mock-cluster"));
    assert_eq!(state.get_nodes_info().len(), 1);
    assert!(state.get_nodes_info()[0].is_up());

    let result = session
        .query("INSERT INTO ks.t (a, b) VALUES (?, ?)", (1_i32, "two"))
        .await
        .unwrap();
    assert!(result.rows().is_none());
    assert_eq!(node.queries_served(), 1);
}

#[tokio::test]
async fn session_executes_prepared_with_transparent_reprepare() {
    setup_tracing();
    let node = MockNode::start(MockNodeOptions {
        fail_first_execute_as_unprepared: true,
        ..Default::default()
    })
    .await;

    let session = builder_for(&node).build().await.unwrap();

    let prepared = session
        .prepare("INSERT INTO ks.t (a) VALUES (?)")
        .await
        .unwrap();

    // The first EXECUTE is answered with UNPREPARED; the driver prepares
    // again on the same connection and resends, so the caller only sees
    // the final success.
    let result = session.execute(&prepared, (7_i32,)).await.unwrap();
    assert!(result.rows().is_none());
    assert_eq!(node.queries_served(), 1);
}

#[tokio::test]
async fn session_caches_prepared_statements() {
    setup_tracing();
    let node = MockNode::start(MockNodeOptions::default()).await;
    let session = builder_for(&node).build().await.unwrap();

    let first = session.prepare("SELECT a FROM ks.t WHERE a = ?").await.unwrap();
    let second = session.prepare("SELECT a FROM ks.t WHERE a = ?").await.unwrap();
    assert_eq!(first.get_id(), second.get_id());
}

#[tokio::test]
async fn session_retries_on_unavailable_until_plan_exhausts() {
    setup_tracing();
    let node = MockNode::start(MockNodeOptions {
        always_unavailable: true,
        ..Default::default()
    })
    .await;

    let session = builder_for(&node).build().await.unwrap();

    // The single node answers Unavailable; the retry policy moves to the
    // next node, the plan exhausts, and the caller gets NoHostAvailable
    // with the per-host cause attached.
    let result = session.query("SELECT a FROM ks.t", ()).await;
    match result {
        Err(QueryError::NoHostAvailable(err)) => {
            assert_eq!(err.errors.len(), 1);
            let (addr, cause) = err.errors.iter().next().unwrap();
            assert_eq!(*addr, node.address());
            assert!(cause.contains("consistency"), "unexpected cause: {}", cause);
        }
        other => panic!("expected NoHostAvailable, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn session_request_timeout_fires() {
    setup_tracing();
    let node = MockNode::start(MockNodeOptions {
        stall_data_queries: true,
        ..Default::default()
    })
    .await;

    let session = builder_for(&node)
        .request_timeout(Some(Duration::from_millis(100)))
        .build()
        .await
        .unwrap();

    let result = session.query("SELECT a FROM ks.t", ()).await;
    assert_matches!(result, Err(QueryError::RequestTimeout(_)));

    // A per-statement override beats the session default.
    let mut query = Query::new("SELECT a FROM ks.t");
    query.set_request_timeout(Some(Duration::from_millis(50)));
    let started = std::time::Instant::now();
    let result = session.query(query, ()).await;
    assert_matches!(result, Err(QueryError::RequestTimeout(d)) if d == Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn session_use_keyspace_propagates() {
    setup_tracing();
    let node = MockNode::start(MockNodeOptions::default()).await;
    let session = builder_for(&node).build().await.unwrap();

    session.use_keyspace("app_data", false).await.unwrap();

    // Invalid names are rejected locally.
    let result = session.use_keyspace("bad name!", false).await;
    assert_matches!(result, Err(QueryError::BadQuery(_)));
}

#[tokio::test]
async fn session_batch_roundtrip() {
    setup_tracing();
    let node = MockNode::start(MockNodeOptions::default()).await;
    let session = builder_for(&node).build().await.unwrap();

    let mut batch = Batch::new(BatchType::Logged);
    batch.append_statement("INSERT INTO ks.t (a) VALUES (1)");
    batch.append_statement("INSERT INTO ks.t (a) VALUES (2)");

    let values: Vec<SerializedValues> = vec![SerializedValues::new(), SerializedValues::new()];
    session.batch(&batch, &values).await.unwrap();
    assert_eq!(node.queries_served(), 1);

    // Mismatched value list count is rejected locally.
    let result = session.batch(&batch, &[SerializedValues::new()]).await;
    assert_matches!(result, Err(QueryError::BadQuery(_)));
}

#[tokio::test]
async fn session_rejects_serial_top_level_consistency() {
    setup_tracing();
    let node = MockNode::start(MockNodeOptions::default()).await;
    let session = builder_for(&node).build().await.unwrap();

    let mut query = Query::new("SELECT a FROM ks.t");
    query.set_consistency(basalt_cql::Consistency::Serial);
    let result = session.query(query, ()).await;
    assert_matches!(
        result,
        Err(QueryError::BadQuery(
            crate::errors::BadQuery::SerialConsistencyForbidden(_)
        ))
    );
    // The request never reached the server.
    assert_eq!(node.queries_served(), 0);
}

#[tokio::test]
async fn session_schema_agreement_on_single_node() {
    setup_tracing();
    let node = MockNode::start(MockNodeOptions::default()).await;
    let session = builder_for(&node).build().await.unwrap();

    let agreed = session.check_schema_agreement().await.unwrap();
    assert!(agreed.is_some());

    let version = session.await_schema_agreement().await.unwrap();
    assert_eq!(version, agreed.unwrap());
}

#[tokio::test]
async fn snapshot_survives_control_connection_loss() {
    setup_tracing();
    let node = MockNode::start(MockNodeOptions::default()).await;
    let session = builder_for(&node).build().await.unwrap();

    let keyspaces_before = session.get_keyspaces();
    node.kill().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The control connection is gone, but reads of the cluster view serve
    // the last good snapshot instead of erroring.
    let state = session.get_cluster_state();
    assert_eq!(state.cluster_name(), Some("mock-cluster"));
    assert_eq!(session.get_keyspaces().len(), keyspaces_before.len());

    // Requests, on the other hand, eventually fail.
    let result = session
        .query("SELECT a FROM ks.t", ())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn session_event_subscriptions_are_multi_consumer() {
    setup_tracing();
    let node = MockNode::start(MockNodeOptions::default()).await;
    let session = builder_for(&node).build().await.unwrap();

    // Any number of subscribers can be attached; the channels stay open
    // for the session's lifetime.
    let _host_up = session.subscribe_host_up_events();
    let _host_up_other = session.subscribe_host_up_events();
    let _host_down = session.subscribe_host_down_events();
    let _schema = session.subscribe_schema_events();
}
