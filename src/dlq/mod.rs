//! Redelivery policy and dead-letter sinks.
//!
//! Store outages never spend the budget: those messages are requeued until
//! the store comes back. A document the store rejects is requeued until it
//! has been rejected `max_attempts` times, then handed to a
//! [`DeadLetterSink`] and acknowledged. Malformed bodies skip the budget and
//! go straight to the sink unless configured otherwise. Without a configured
//! sink nothing is discarded: every failure is requeued.
//!
//! ## Message Format
//!
//! Dead letters are published as a JSON envelope to the
//! `logs_dead_letter` exchange:
//! - Origin (queue, message id)
//! - Original body (lossy UTF-8)
//! - Reason and attempt count
//! - Timestamp
//!
//! A sink failure never drops the message: the consumer requeues it instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broker::OutboundMessage;
use crate::event::CONTENT_TYPE_JSON;
use crate::supervisor::ConnectionHandle;
use crate::topology::ROUTING_KEY;

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("No broker connection for dead-lettering")]
    NoConnection,

    #[error("Failed to serialize dead letter: {0}")]
    Serialization(String),

    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The body is not a log event.
    Malformed,
    /// The store rejected it `max_attempts` times.
    Exhausted,
}

/// A message removed from its queue for manual review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub queue: String,
    pub message_id: Option<String>,
    pub body: String,
    pub reason: DeadLetterReason,
    /// Last error seen while processing.
    pub error: String,
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        queue: &str,
        message_id: Option<&str>,
        body: &[u8],
        reason: DeadLetterReason,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            queue: queue.to_string(),
            message_id: message_id.map(str::to_string),
            body: String::from_utf8_lossy(body).into_owned(),
            reason,
            error: error.into(),
            attempts,
            occurred_at: Utc::now(),
        }
    }
}

/// Destination for dead letters.
///
/// Implementations handle the actual transport (broker exchange, in-memory, etc.).
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError>;

    /// Whether dead letters actually go anywhere.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Logs dead letters and discards them.
pub struct NoopDeadLetterSink;

#[async_trait]
impl DeadLetterSink for NoopDeadLetterSink {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        warn!(
            queue = %dead_letter.queue,
            reason = ?dead_letter.reason,
            attempts = dead_letter.attempts,
            error = %dead_letter.error,
            "Dead letter discarded"
        );
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

/// In-memory sink using a channel.
///
/// Used for testing.
pub struct ChannelDeadLetterSink {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterSink {
    /// Returns the sink and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterSink for ChannelDeadLetterSink {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        self.sender
            .send(dead_letter)
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

/// Publishes dead letters to a broker exchange over the current connection.
pub struct BrokerDeadLetterSink {
    connection: ConnectionHandle,
    exchange: String,
}

impl BrokerDeadLetterSink {
    pub fn new(connection: ConnectionHandle, exchange: &str) -> Self {
        Self {
            connection,
            exchange: exchange.to_string(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for BrokerDeadLetterSink {
    async fn publish(&self, dead_letter: DeadLetter) -> Result<(), DlqError> {
        let body = serde_json::to_vec(&dead_letter)
            .map_err(|e| DlqError::Serialization(e.to_string()))?;
        let conn = self.connection.current().ok_or(DlqError::NoConnection)?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()))?;

        let message = OutboundMessage {
            body,
            content_type: CONTENT_TYPE_JSON.to_string(),
            message_id: dead_letter.message_id.clone(),
            persistent: true,
        };
        let result = channel
            .publish(&self.exchange, ROUTING_KEY, message)
            .await
            .map_err(|e| DlqError::PublishFailed(e.to_string()));
        let _ = channel.close().await;
        result?;

        info!(
            exchange = %self.exchange,
            queue = %dead_letter.queue,
            reason = ?dead_letter.reason,
            attempts = dead_letter.attempts,
            "Message dead-lettered"
        );
        Ok(())
    }
}

/// What to do with a body that does not decode as a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedAction {
    /// Dead-letter immediately.
    #[default]
    DeadLetter,
    /// Count it against the redelivery budget like any other failure.
    Requeue,
}

/// Outcome of a failed processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Requeue,
    DeadLetter,
}

/// Redelivery budget plus the dead-letter target.
#[derive(Clone)]
pub struct RedeliveryPolicy {
    /// Failures allowed before dead-lettering. 0 = requeue forever.
    pub max_attempts: u32,
    pub malformed: MalformedAction,
    pub dead_letter: Arc<dyn DeadLetterSink>,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            malformed: MalformedAction::DeadLetter,
            dead_letter: Arc::new(NoopDeadLetterSink),
        }
    }
}

impl RedeliveryPolicy {
    /// Requeue every failure forever.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: 0,
            malformed: MalformedAction::Requeue,
            ..Self::default()
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = sink;
        self
    }

    /// Decide after the store rejected a document, `attempts` counting this one.
    pub fn on_failure(&self, attempts: u32) -> Verdict {
        if !self.dead_letter.is_configured() {
            return Verdict::Requeue;
        }
        if self.max_attempts > 0 && attempts >= self.max_attempts {
            Verdict::DeadLetter
        } else {
            Verdict::Requeue
        }
    }

    /// Decide after a decode failure, `attempts` counting this one.
    pub fn on_malformed(&self, attempts: u32) -> Verdict {
        match self.malformed {
            MalformedAction::DeadLetter if self.dead_letter.is_configured() => Verdict::DeadLetter,
            MalformedAction::DeadLetter => Verdict::Requeue,
            MalformedAction::Requeue => self.on_failure(attempts),
        }
    }
}

impl std::fmt::Debug for RedeliveryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedeliveryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("malformed", &self.malformed)
            .field("dead_letter", &self.dead_letter.is_configured())
            .finish()
    }
}

/// Messages an [`AttemptTracker`] remembers before evicting the stalest.
pub const DEFAULT_TRACKER_CAPACITY: usize = 10_000;

/// Failure counts per message, local to one consumer.
///
/// Bounded: once full, the entry touched longest ago is forgotten. A message
/// evicted that way starts a fresh budget if it fails again.
#[derive(Debug)]
pub struct AttemptTracker {
    /// Key to (failures, last touch).
    failures: HashMap<String, (u32, u64)>,
    capacity: usize,
    clock: u64,
}

impl Default for AttemptTracker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TRACKER_CAPACITY)
    }
}

impl AttemptTracker {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            failures: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    /// Identity of a delivery: its message id, or a SHA-256 of the body.
    pub fn key(message_id: Option<&str>, body: &[u8]) -> String {
        match message_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => hex::encode(Sha256::digest(body)),
        }
    }

    /// Count a failure, returning the total so far.
    pub fn record_failure(&mut self, key: &str) -> u32 {
        self.clock += 1;
        if !self.failures.contains_key(key) && self.failures.len() >= self.capacity {
            self.evict_stalest();
        }
        let entry = self.failures.entry(key.to_string()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = self.clock;
        entry.0
    }

    fn evict_stalest(&mut self) {
        let stalest = self
            .failures
            .iter()
            .min_by_key(|(_, (_, touched))| *touched)
            .map(|(key, _)| key.clone());
        if let Some(key) = stalest {
            self.failures.remove(&key);
        }
    }

    /// Forget a message once it left the queue.
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
