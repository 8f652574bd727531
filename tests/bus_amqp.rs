//! RabbitMQ integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container. No manual setup required.

use std::sync::Arc;
use std::time::Duration;

use log_ingest::broker::{AmqpBroker, Broker, DeclareOptions};
use log_ingest::event::LogEvent;
use log_ingest::pipeline::{Pipeline, PipelineError, PipelineSettings};
use log_ingest::store::MemoryLogStore;
use log_ingest::supervisor::{ConnectionSupervisor, SupervisorConfig};
use log_ingest::topology::Topology;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url).
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");
    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);
    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

fn settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.supervisor.retry_delay = Duration::from_millis(200);
    settings.consumer.retry_delay = Duration::from_millis(200);
    settings
}

async fn wait_for_documents(store: &MemoryLogStore, count: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while store.len().await < count {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("documents should be persisted");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_events_flow_to_store() {
    let (_container, url) = start_rabbitmq().await;
    let store = Arc::new(MemoryLogStore::new());

    let pipeline = Pipeline::start(Arc::new(AmqpBroker::new(url)), store.clone(), settings())
        .await
        .expect("pipeline should start");

    for source in ["auth", "map_coloring", "map_storage", "unknown"] {
        pipeline
            .publisher()
            .publish(&LogEvent::builder(source, "integration").user_id("1").build())
            .await
            .expect("publish should succeed");
    }

    wait_for_documents(&store, 4).await;
    let mut sources: Vec<String> = store
        .documents()
        .await
        .into_iter()
        .map(|d| d.event.service_name().to_string())
        .collect();
    sources.sort();
    assert_eq!(sources, ["auth", "map_coloring", "map_storage", "unknown"]);

    pipeline.shutdown().await.expect("clean shutdown");
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_topology_redeclaration_is_idempotent() {
    let (_container, url) = start_rabbitmq().await;
    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(url));
    let topology = Arc::new(Topology::standard());

    for _ in 0..2 {
        let supervisor = ConnectionSupervisor::new(
            Arc::clone(&broker),
            Arc::clone(&topology),
            SupervisorConfig::default(),
        );
        supervisor.start().await.expect("declaration should succeed");
        supervisor.close().await;
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_conflicting_queue_fails_startup() {
    let (_container, url) = start_rabbitmq().await;
    let broker = AmqpBroker::new(url.clone());

    let conn = broker.connect().await.expect("connect");
    let channel = conn.create_channel().await.expect("channel");
    channel
        .declare_queue(
            "auth_logs_queue",
            DeclareOptions {
                durable: false,
                ..DeclareOptions::durable()
            },
        )
        .await
        .expect("declare");
    channel.close().await.expect("close");

    let result = Pipeline::start(
        Arc::new(AmqpBroker::new(url)),
        Arc::new(MemoryLogStore::new()),
        settings(),
    )
    .await;

    match result {
        Err(PipelineError::Supervisor(e)) => assert!(e.is_fatal(), "got {}", e),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("startup should fail on conflicting queue"),
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_unacked_message_survives_restart() {
    let (_container, url) = start_rabbitmq().await;
    let store = Arc::new(MemoryLogStore::new());
    store.set_fail(true).await;

    let pipeline = Pipeline::start(
        Arc::new(AmqpBroker::new(url.clone())),
        store.clone(),
        settings(),
    )
    .await
    .expect("pipeline should start");
    pipeline
        .publisher()
        .publish(&LogEvent::builder("auth", "restart").build())
        .await
        .expect("publish should succeed");
    tokio::time::sleep(Duration::from_millis(500)).await;
    pipeline.shutdown().await.expect("clean shutdown");
    assert_eq!(store.len().await, 0);

    store.set_fail(false).await;
    let restarted = Pipeline::start(Arc::new(AmqpBroker::new(url)), store.clone(), settings())
        .await
        .expect("pipeline should restart");

    wait_for_documents(&store, 1).await;
    restarted.shutdown().await.expect("clean shutdown");
}
