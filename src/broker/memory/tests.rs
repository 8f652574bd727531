use super::*;
use std::time::Duration;

fn message(body: &str) -> OutboundMessage {
    OutboundMessage {
        body: body.as_bytes().to_vec(),
        content_type: "application/json".to_string(),
        message_id: Some(format!("id-{}", body)),
        persistent: true,
    }
}

async fn declare_pair(channel: &dyn BrokerChannel, exchange: &str, queue: &str) {
    channel
        .declare_exchange(exchange, DeclareOptions::durable())
        .await
        .unwrap();
    channel
        .declare_queue(queue, DeclareOptions::durable())
        .await
        .unwrap();
    channel.bind_queue(queue, exchange, "").await.unwrap();
}

async fn next(stream: &mut DeliveryStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Stream ended")
        .expect("Delivery error")
}

#[tokio::test]
async fn test_fanout_copies_to_every_bound_queue() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let channel = conn.create_channel().await.unwrap();

    declare_pair(channel.as_ref(), "auth_logs", "auth_logs_queue").await;
    channel
        .declare_queue("audit_queue", DeclareOptions::durable())
        .await
        .unwrap();
    channel
        .bind_queue("audit_queue", "auth_logs", "ignored")
        .await
        .unwrap();

    channel
        .publish("auth_logs", "", message("a"))
        .await
        .unwrap();

    assert_eq!(broker.queue_depth("auth_logs_queue"), 1);
    assert_eq!(broker.queue_depth("audit_queue"), 1);
    assert_eq!(broker.stats().published, 1);
}

#[tokio::test]
async fn test_publish_to_unbound_exchange_is_not_an_error() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let channel = conn.create_channel().await.unwrap();
    channel
        .declare_exchange("lonely", DeclareOptions::durable())
        .await
        .unwrap();

    assert!(channel.publish("lonely", "", message("a")).await.is_ok());
}

#[tokio::test]
async fn test_publish_to_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let channel = conn.create_channel().await.unwrap();

    let result = channel.publish("missing", "", message("a")).await;
    assert!(matches!(result, Err(BrokerError::NotFound(_))));
}

#[tokio::test]
async fn test_identical_redeclare_is_noop() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let channel = conn.create_channel().await.unwrap();

    declare_pair(channel.as_ref(), "auth_logs", "auth_logs_queue").await;
    declare_pair(channel.as_ref(), "auth_logs", "auth_logs_queue").await;

    assert_eq!(broker.exchange_names(), vec!["auth_logs".to_string()]);
    assert_eq!(broker.queue_names(), vec!["auth_logs_queue".to_string()]);
    assert_eq!(broker.bindings("auth_logs"), vec!["auth_logs_queue".to_string()]);
}

#[tokio::test]
async fn test_conflicting_redeclare_fails_and_closes_channel() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let channel = conn.create_channel().await.unwrap();
    channel
        .declare_exchange("auth_logs", DeclareOptions::durable())
        .await
        .unwrap();

    let transient = DeclareOptions {
        durable: false,
        ..DeclareOptions::durable()
    };
    let result = channel.declare_exchange("auth_logs", transient).await;

    assert!(matches!(result, Err(BrokerError::PreconditionFailed(_))));
    assert!(!channel.is_open());
    assert!(conn.is_open());
}

#[tokio::test]
async fn test_prefetch_one_holds_back_second_delivery() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let channel = conn.create_channel().await.unwrap();
    declare_pair(channel.as_ref(), "ex", "q").await;
    channel.publish("ex", "", message("1")).await.unwrap();
    channel.publish("ex", "", message("2")).await.unwrap();

    channel.set_prefetch(1).await.unwrap();
    let mut stream = channel.consume("q", "test").await.unwrap();

    let first = next(&mut stream).await;
    assert_eq!(first.body, b"1");
    assert_eq!(broker.unacked("q"), 1);

    let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(pending.is_err(), "second delivery must wait for the ack");

    first.ack().await.unwrap();
    let second = next(&mut stream).await;
    assert_eq!(second.body, b"2");
    second.ack().await.unwrap();

    assert_eq!(broker.stats().acked, 2);
    assert_eq!(broker.queue_depth("q"), 0);
}

#[tokio::test]
async fn test_nack_requeue_redelivers_at_head() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let channel = conn.create_channel().await.unwrap();
    declare_pair(channel.as_ref(), "ex", "q").await;
    channel.publish("ex", "", message("1")).await.unwrap();
    channel.publish("ex", "", message("2")).await.unwrap();

    channel.set_prefetch(1).await.unwrap();
    let mut stream = channel.consume("q", "test").await.unwrap();

    let first = next(&mut stream).await;
    assert!(!first.redelivered);
    first.nack(true).await.unwrap();

    let again = next(&mut stream).await;
    assert_eq!(again.body, b"1");
    assert!(again.redelivered);
    assert_eq!(again.message_id.as_deref(), Some("id-1"));
    again.ack().await.unwrap();

    let stats = broker.stats();
    assert_eq!(stats.nacked, 1);
    assert_eq!(stats.requeued, 1);
}

#[tokio::test]
async fn test_nack_without_requeue_drops_message() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let channel = conn.create_channel().await.unwrap();
    declare_pair(channel.as_ref(), "ex", "q").await;
    channel.publish("ex", "", message("1")).await.unwrap();

    let mut stream = channel.consume("q", "test").await.unwrap();
    next(&mut stream).await.nack(false).await.unwrap();

    assert_eq!(broker.queue_depth("q"), 0);
    assert_eq!(broker.stats().requeued, 0);
}

#[tokio::test]
async fn test_connection_drop_ends_stream_and_requeues_unacked() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let channel = conn.create_channel().await.unwrap();
    declare_pair(channel.as_ref(), "ex", "q").await;
    channel.publish("ex", "", message("1")).await.unwrap();

    let mut stream = channel.consume("q", "test").await.unwrap();
    let held = next(&mut stream).await;

    broker.drop_connections();

    let ended = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("stream should end promptly");
    assert!(ended.is_none());
    assert!(!conn.is_open());
    assert!(held.ack().await.is_err());
    assert_eq!(broker.queue_depth("q"), 1);
}

#[tokio::test]
async fn test_closed_notification_fires_on_drop() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let closed = conn.closed();

    broker.drop_connections();

    tokio::time::timeout(Duration::from_secs(1), closed)
        .await
        .expect("close notification should fire");
    assert!(conn.create_channel().await.is_err());
}

#[tokio::test]
async fn test_closed_notification_after_close_resolves_immediately() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    conn.close().await.unwrap();

    tokio::time::timeout(Duration::from_millis(100), conn.closed())
        .await
        .expect("already-closed connection should resolve");
}

#[tokio::test]
async fn test_offline_and_refused_connects() {
    let broker = MemoryBroker::new();

    broker.set_offline(true);
    assert!(broker.connect().await.is_err());
    broker.set_offline(false);

    broker.refuse_next_connects(2);
    assert!(broker.connect().await.is_err());
    assert!(broker.connect().await.is_err());
    assert!(broker.connect().await.is_ok());
    assert_eq!(broker.stats().connections, 1);
}

#[tokio::test]
async fn test_inject_routes_raw_body() {
    let broker = MemoryBroker::new();
    let conn = broker.connect().await.unwrap();
    let channel = conn.create_channel().await.unwrap();
    declare_pair(channel.as_ref(), "ex", "q").await;

    broker.inject("ex", "garbage").unwrap();

    let mut stream = channel.consume("q", "test").await.unwrap();
    let delivery = next(&mut stream).await;
    assert_eq!(delivery.body, b"garbage");
    assert!(delivery.message_id.is_none());
}
