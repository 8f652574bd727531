//! Durable queue consumers.
//!
//! One consumer task per queue drains deliveries into the document store.
//!
//! ```text
//!            +-------------+  subscribed   +-----------+
//!  start --> | Connecting  | ------------> | Consuming |
//!            +-------------+               +-----------+
//!              ^   |  failure: wait             |
//!              |   +-- retry_delay or new       | channel closed
//!              |       connection               |
//!              +--------------------------------+
//!  shutdown (any state) --> Stopped
//! ```
//!
//! Messages are acknowledged only after the store accepted them. Store
//! outages are requeued until the store recovers, however long that takes.
//! Rejected documents and malformed bodies are requeued until the
//! [`RedeliveryPolicy`] says to dead-letter them. Every requeue waits a
//! doubling redelivery delay first. Shutdown never interrupts a message
//! mid-insert.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, BrokerError, Delivery, DeliveryStream};
use crate::dlq::{AttemptTracker, DeadLetter, DeadLetterReason, RedeliveryPolicy, Verdict};
use crate::event::LogEvent;
use crate::store::LogStore;
use crate::supervisor::ConnectionHandle;
use crate::utils::retry::redelivery_delay;
use crate::utils::shutdown::ShutdownSignal;

/// Per-consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Unacknowledged deliveries held at once.
    pub prefetch: u16,
    /// Pause before resubscribing after a failure.
    pub retry_delay: Duration,
    /// First pause before requeueing a failed delivery.
    pub redelivery_delay: Duration,
    /// Ceiling for the doubling redelivery pause.
    pub max_redelivery_delay: Duration,
    /// Consumer tags are `{tag_prefix}-{queue}`.
    pub tag_prefix: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            retry_delay: Duration::from_secs(5),
            redelivery_delay: Duration::from_millis(100),
            max_redelivery_delay: Duration::from_secs(5),
            tag_prefix: "log-ingest".to_string(),
        }
    }
}

/// Lifecycle of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connecting,
    Consuming,
    Stopped,
}

/// Why a subscription ended.
enum Exit {
    Cancelled,
    ChannelClosed,
}

/// A failed attempt at one delivery.
struct Failure {
    reason: DeadLetterReason,
    error: String,
    attempts: u32,
}

/// Consumes one queue until shutdown.
pub struct DurableConsumer {
    queue: String,
    connection: ConnectionHandle,
    store: Arc<dyn LogStore>,
    policy: RedeliveryPolicy,
    config: ConsumerConfig,
    attempts: AttemptTracker,
    state: watch::Sender<ConsumerState>,
}

impl DurableConsumer {
    pub fn new(
        queue: &str,
        connection: ConnectionHandle,
        store: Arc<dyn LogStore>,
        policy: RedeliveryPolicy,
        config: ConsumerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Connecting);
        Self {
            queue: queue.to_string(),
            connection,
            store,
            policy,
            config,
            attempts: AttemptTracker::default(),
            state,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` fires.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            self.state.send_replace(ConsumerState::Connecting);

            match self.subscribe().await {
                Ok((channel, stream)) => {
                    self.state.send_replace(ConsumerState::Consuming);
                    info!(queue = %self.queue, "Consuming");

                    let exit = self.consume(stream, &shutdown).await;
                    if let Err(e) = channel.close().await {
                        debug!(queue = %self.queue, error = %e, "Consumer channel close failed");
                    }
                    match exit {
                        Exit::Cancelled => break,
                        Exit::ChannelClosed => {
                            warn!(queue = %self.queue, "Consumer channel closed, resubscribing");
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        queue = %self.queue,
                        error = %e,
                        "Failed to subscribe, retrying in {:?}",
                        self.config.retry_delay
                    );
                }
            }

            self.state.send_replace(ConsumerState::Connecting);
            tokio::select! {
                _ = self.connection.wait_for_new(self.config.retry_delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.state.send_replace(ConsumerState::Stopped);
        info!(queue = %self.queue, "Consumer stopped");
    }

    /// Channel with prefetch set, consuming with manual acks.
    async fn subscribe(&mut self) -> Result<(Box<dyn BrokerChannel>, DeliveryStream), BrokerError> {
        let conn = self
            .connection
            .acquire()
            .ok_or_else(|| BrokerError::Closed("no live broker connection".to_string()))?;
        let channel = conn.create_channel().await?;

        let tag = format!("{}-{}", self.config.tag_prefix, self.queue);
        let stream = match channel.set_prefetch(self.config.prefetch).await {
            Ok(()) => channel.consume(&self.queue, &tag).await,
            Err(e) => Err(e),
        };
        match stream {
            Ok(stream) => Ok((channel, stream)),
            Err(e) => {
                let _ = channel.close().await;
                Err(e)
            }
        }
    }

    async fn consume(&mut self, mut stream: DeliveryStream, shutdown: &ShutdownSignal) -> Exit {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Exit::Cancelled,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.handle(delivery, shutdown).await,
                Some(Err(e)) => {
                    warn!(queue = %self.queue, error = %e, "Delivery stream failed");
                    return Exit::ChannelClosed;
                }
                None => return Exit::ChannelClosed,
            }
        }
    }

    async fn handle(&mut self, delivery: Delivery, shutdown: &ShutdownSignal) {
        let key = AttemptTracker::key(delivery.message_id.as_deref(), &delivery.body);

        let event = match LogEvent::from_json(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                let attempts = self.attempts.record_failure(&key);
                warn!(
                    queue = %self.queue,
                    attempt = attempts,
                    error = %e,
                    "Failed to decode log event"
                );
                let verdict = self.policy.on_malformed(attempts);
                let failure = Failure {
                    reason: DeadLetterReason::Malformed,
                    error: e.to_string(),
                    attempts,
                };
                self.settle_failure(delivery, &key, verdict, failure, shutdown)
                    .await;
                return;
            }
        };

        match self.store.insert(&event).await {
            Ok(id) => {
                self.attempts.clear(&key);
                match delivery.ack().await {
                    Ok(()) => debug!(queue = %self.queue, id = %id, "Log persisted"),
                    Err(e) => warn!(
                        queue = %self.queue,
                        id = %id,
                        error = %e,
                        "Ack failed after insert, message will be redelivered"
                    ),
                }
            }
            Err(e) if e.is_transient() => {
                let attempts = self.attempts.record_failure(&key);
                warn!(
                    queue = %self.queue,
                    service_name = %event.service_name(),
                    attempt = attempts,
                    error = %e,
                    "Store unavailable, requeueing log event"
                );
                self.requeue(&delivery, attempts, shutdown).await;
            }
            Err(e) => {
                let attempts = self.attempts.record_failure(&key);
                warn!(
                    queue = %self.queue,
                    service_name = %event.service_name(),
                    attempt = attempts,
                    error = %e,
                    "Store rejected log event"
                );
                let verdict = self.policy.on_failure(attempts);
                let failure = Failure {
                    reason: DeadLetterReason::Exhausted,
                    error: e.to_string(),
                    attempts,
                };
                self.settle_failure(delivery, &key, verdict, failure, shutdown)
                    .await;
            }
        }
    }

    async fn settle_failure(
        &mut self,
        delivery: Delivery,
        key: &str,
        verdict: Verdict,
        failure: Failure,
        shutdown: &ShutdownSignal,
    ) {
        let attempts = failure.attempts;
        if verdict == Verdict::Requeue {
            self.requeue(&delivery, attempts, shutdown).await;
            return;
        }

        let dead_letter = DeadLetter::new(
            &self.queue,
            delivery.message_id.as_deref(),
            &delivery.body,
            failure.reason,
            failure.error,
            attempts,
        );
        match self.policy.dead_letter.publish(dead_letter).await {
            Ok(()) => {
                self.attempts.clear(key);
                if let Err(e) = delivery.ack().await {
                    warn!(queue = %self.queue, error = %e, "Ack failed after dead-lettering");
                }
            }
            Err(e) => {
                error!(
                    queue = %self.queue,
                    error = %e,
                    "Dead-lettering failed, requeueing instead"
                );
                self.requeue(&delivery, attempts, shutdown).await;
            }
        }
    }

    /// Nack with requeue after the redelivery delay. Shutdown cuts the wait short.
    async fn requeue(&self, delivery: &Delivery, failures: u32, shutdown: &ShutdownSignal) {
        let delay = redelivery_delay(
            self.config.redelivery_delay,
            self.config.max_redelivery_delay,
            failures,
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {}
        }
        if let Err(e) = delivery.nack(true).await {
            warn!(queue = %self.queue, error = %e, "Nack failed");
        }
    }
}

struct ConsumerTask {
    queue: String,
    state: watch::Receiver<ConsumerState>,
    handle: JoinHandle<()>,
}

/// One running consumer per queue.
pub struct ConsumerSet {
    tasks: Vec<ConsumerTask>,
}

impl ConsumerSet {
    /// Spawn a consumer for each queue.
    pub fn spawn(
        queues: &[String],
        connection: &ConnectionHandle,
        store: Arc<dyn LogStore>,
        policy: &RedeliveryPolicy,
        config: &ConsumerConfig,
        shutdown: &ShutdownSignal,
    ) -> Self {
        let tasks = queues
            .iter()
            .map(|queue| {
                let consumer = DurableConsumer::new(
                    queue,
                    connection.clone(),
                    Arc::clone(&store),
                    policy.clone(),
                    config.clone(),
                );
                let state = consumer.state();
                let handle = tokio::spawn(consumer.run(shutdown.clone()));
                ConsumerTask {
                    queue: queue.clone(),
                    state,
                    handle,
                }
            })
            .collect();
        Self { tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Current state of each consumer, by queue.
    pub fn states(&self) -> Vec<(String, ConsumerState)> {
        self.tasks
            .iter()
            .map(|t| (t.queue.clone(), *t.state.borrow()))
            .collect()
    }

    pub fn all_consuming(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| *t.state.borrow() == ConsumerState::Consuming)
    }

    /// Wait for every consumer to stop.
    pub async fn join(self) {
        for task in self.tasks {
            if let Err(e) = task.handle.await {
                error!(queue = %task.queue, error = %e, "Consumer task failed");
            }
        }
    }
}
