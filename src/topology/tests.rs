use super::*;
use crate::broker::{Broker, MemoryBroker};

#[test]
fn test_naming() {
    assert_eq!(exchange_name("auth"), "auth_logs");
    assert_eq!(queue_name("map_storage"), "map_storage_logs_queue");
}

#[test]
fn test_standard_routes_known_sources() {
    let topology = Topology::standard();
    assert_eq!(topology.exchange_for("auth"), "auth_logs");
    assert_eq!(topology.exchange_for("map_coloring"), "map_coloring_logs");
    assert_eq!(topology.exchange_for("map_storage"), "map_storage_logs");
}

#[test]
fn test_unknown_source_routes_to_default() {
    let topology = Topology::standard();
    assert_eq!(topology.exchange_for("billing"), "map_coloring_logs");
    assert_eq!(topology.exchange_for(""), "map_coloring_logs");
}

#[test]
fn test_consumer_queues_exclude_dead_letter() {
    let queues = Topology::standard().consumer_queues();
    assert_eq!(
        queues,
        vec![
            "auth_logs_queue".to_string(),
            "map_coloring_logs_queue".to_string(),
            "map_storage_logs_queue".to_string(),
        ]
    );
}

#[test]
fn test_new_rejects_unrouted_default() {
    let result = Topology::new(vec![Route::for_source("auth")], "billing");
    assert!(matches!(result, Err(TopologyError::Invalid(_))));
}

#[tokio::test]
async fn test_ensure_topology_declares_everything() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();

    ensure_topology(conn.as_ref(), &Topology::standard())
        .await
        .unwrap();

    assert_eq!(
        broker.exchange_names(),
        vec![
            "auth_logs",
            "logs_dead_letter",
            "map_coloring_logs",
            "map_storage_logs"
        ]
    );
    assert_eq!(broker.queue_names().len(), 4);
    assert_eq!(broker.bindings("auth_logs"), vec!["auth_logs_queue"]);
    assert_eq!(
        broker.bindings(DEAD_LETTER_EXCHANGE),
        vec![DEAD_LETTER_QUEUE]
    );
}

#[tokio::test]
async fn test_ensure_topology_twice_is_idempotent() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let topology = Topology::standard();

    ensure_topology(conn.as_ref(), &topology).await.unwrap();
    let exchanges = broker.exchange_names();
    let queues = broker.queue_names();

    ensure_topology(conn.as_ref(), &topology).await.unwrap();

    assert_eq!(broker.exchange_names(), exchanges);
    assert_eq!(broker.queue_names(), queues);
    assert_eq!(broker.bindings("map_storage_logs").len(), 1);
}

#[tokio::test]
async fn test_ensure_topology_conflict_is_fatal() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();

    // Someone declared the exchange as transient.
    let channel = conn.create_channel().await.unwrap();
    channel
        .declare_exchange(
            "auth_logs",
            DeclareOptions {
                durable: false,
                ..DeclareOptions::durable()
            },
        )
        .await
        .unwrap();

    let err = ensure_topology(conn.as_ref(), &Topology::standard())
        .await
        .unwrap_err();

    assert!(matches!(err, TopologyError::Conflict(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_ensure_topology_on_closed_connection_is_transient() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    broker.drop_connections();

    let err = ensure_topology(conn.as_ref(), &Topology::standard())
        .await
        .unwrap_err();

    assert!(matches!(err, TopologyError::Broker(_)));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn test_multiple_queues_per_exchange() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let topology = Topology::new(
        vec![Route {
            source: "auth".to_string(),
            exchange: "auth_logs".to_string(),
            queues: vec!["auth_logs_queue".to_string(), "auth_audit_queue".to_string()],
        }],
        "auth",
    )
    .unwrap();

    ensure_topology(conn.as_ref(), &topology).await.unwrap();

    assert_eq!(
        broker.bindings("auth_logs"),
        vec!["auth_audit_queue", "auth_logs_queue"]
    );
    assert!(topology.dead_letter().is_none());
}
