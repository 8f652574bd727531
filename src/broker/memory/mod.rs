//! In-memory broker.
//!
//! Behaves like a single RabbitMQ node for the subset the pipeline uses:
//! fan-out exchanges, durable queues, bindings, per-channel prefetch,
//! manual ack/nack with requeue, and close notifications. Connections can be
//! dropped or refused on demand to exercise the recovery paths.
//!
//! Unacknowledged deliveries return to the head of their queue, flagged as
//! redelivered, when their channel or connection closes.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::debug;

use super::{
    Acknowledger, Broker, BrokerChannel, BrokerConnection, BrokerError, DeclareOptions, Delivery,
    DeliveryStream, OutboundMessage, Result,
};

/// Counters exposed for assertions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    /// Successful connects.
    pub connections: u64,
    /// Messages accepted by an exchange.
    pub published: u64,
    /// Messages handed to consumers (including redeliveries).
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    /// Nacked or orphaned messages put back on a queue.
    pub requeued: u64,
    /// Exchange and queue declarations, including no-op redeclarations.
    pub declarations: u64,
}

#[derive(Clone)]
struct StoredMessage {
    body: Vec<u8>,
    message_id: Option<String>,
    redelivered: bool,
}

struct QueueState {
    options: DeclareOptions,
    ready: VecDeque<StoredMessage>,
}

struct ConnectionState {
    open: bool,
    closed_tx: watch::Sender<bool>,
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
    /// delivery tag -> (queue, message)
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, DeclareOptions>,
    queues: HashMap<String, QueueState>,
    bindings: HashMap<String, BTreeSet<String>>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    offline: bool,
    refuse_connects: u32,
    stats: BrokerStats,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel: u64) -> bool {
        self.channels.contains_key(&channel)
    }

    /// Close a channel, returning its unacked messages to their queues.
    fn close_channel(&mut self, channel: u64) {
        let Some(state) = self.channels.remove(&channel) else {
            return;
        };
        // Highest tag first so the oldest delivery ends up at the head.
        for (_, (queue, mut message)) in state.unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                q.ready.push_front(message);
                self.stats.requeued += 1;
            }
        }
    }

    fn close_connection(&mut self, connection: u64) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.open = false;
            conn.closed_tx.send_replace(true);
        }
    }
}

struct Shared {
    state: Mutex<State>,
    changed: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wake every consumer stream waiting for state changes.
    fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }
}

/// In-process broker. Cloning shares the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed,
            }),
        }
    }

    /// Drop every live connection, as a network partition would.
    pub fn drop_connections(&self) {
        {
            let mut state = self.shared.lock();
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();
            for id in open {
                state.close_connection(id);
            }
        }
        self.shared.notify();
    }

    /// Close every channel but keep connections up.
    pub fn close_channels(&self) {
        {
            let mut state = self.shared.lock();
            let channels: Vec<u64> = state.channels.keys().copied().collect();
            for channel in channels {
                state.close_channel(channel);
            }
        }
        self.shared.notify();
    }

    /// While offline, every connect attempt is refused.
    pub fn set_offline(&self, offline: bool) {
        self.shared.lock().offline = offline;
    }

    /// Refuse the next `count` connect attempts.
    pub fn refuse_next_connects(&self, count: u32) {
        self.shared.lock().refuse_connects = count;
    }

    /// Delete an exchange and its bindings, as an operator might.
    pub fn delete_exchange(&self, exchange: &str) {
        let mut state = self.shared.lock();
        state.exchanges.remove(exchange);
        state.bindings.remove(exchange);
    }

    /// Publish a raw body to an exchange, bypassing any channel.
    pub fn inject(&self, exchange: &str, body: impl Into<Vec<u8>>) -> Result<()> {
        let message = OutboundMessage {
            body: body.into(),
            content_type: "application/octet-stream".to_string(),
            message_id: None,
            persistent: true,
        };
        route(&self.shared, exchange, message)
    }

    pub fn stats(&self) -> BrokerStats {
        self.shared.lock().stats
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Queues bound to an exchange.
    pub fn bindings(&self, exchange: &str) -> Vec<String> {
        self.shared
            .lock()
            .bindings
            .get(exchange)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages waiting in a queue (not counting unacked deliveries).
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Deliveries from a queue currently held by consumers.
    pub fn unacked(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    /// Live connection count.
    pub fn open_connections(&self) -> usize {
        self.shared
            .lock()
            .connections
            .values()
            .filter(|c| c.open)
            .count()
    }
}

fn route(shared: &Shared, exchange: &str, message: OutboundMessage) -> Result<()> {
    {
        let mut state = shared.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("no exchange '{}'", exchange)));
        }
        let queues: Vec<String> = state
            .bindings
            .get(exchange)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default();
        for queue in queues {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(StoredMessage {
                    body: message.body.clone(),
                    message_id: message.message_id.clone(),
                    redelivered: false,
                });
            }
        }
        state.stats.published += 1;
    }
    shared.notify();
    Ok(())
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.shared.lock();
        if state.offline {
            return Err(BrokerError::Connection("broker offline".to_string()));
        }
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(BrokerError::Connection("connection refused".to_string()));
        }

        let id = state.next_id();
        let (closed_tx, _) = watch::channel(false);
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                closed_tx,
            },
        );
        state.stats.connections += 1;
        debug!(connection = id, "Memory broker connection opened");

        Ok(Arc::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }

    fn endpoint(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.shared
            .lock()
            .connections
            .get(&self.id)
            .map(|c| c.open)
            .unwrap_or(false)
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        let mut state = self.shared.lock();
        let open = state
            .connections
            .get(&self.id)
            .map(|c| c.open)
            .unwrap_or(false);
        if !open {
            return Err(BrokerError::Closed("connection closed".to_string()));
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Box::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let closed_rx = self
            .shared
            .lock()
            .connections
            .get(&self.id)
            .map(|c| c.closed_tx.subscribe());
        Box::pin(async move {
            if let Some(mut closed_rx) = closed_rx {
                let _ = closed_rx.wait_for(|closed| *closed).await;
            }
        })
    }

    async fn close(&self) -> Result<()> {
        self.shared.lock().close_connection(self.id);
        self.shared.notify();
        Ok(())
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &State) -> Result<()> {
        if state.channel_open(self.id) {
            Ok(())
        } else {
            Err(BrokerError::Closed("channel closed".to_string()))
        }
    }

    /// A failed declaration closes the channel, as on a real broker.
    fn conflict(&self, state: &mut State, message: String) -> BrokerError {
        state.close_channel(self.id);
        BrokerError::PreconditionFailed(message)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, options: DeclareOptions) -> Result<()> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        state.stats.declarations += 1;
        match state.exchanges.get(name).copied() {
            Some(existing) if existing != options => Err(self.conflict(
                &mut state,
                format!("exchange '{}' exists with different properties", name),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), options);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: DeclareOptions) -> Result<()> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        state.stats.declarations += 1;
        match state.queues.get(name).map(|q| q.options) {
            Some(existing) if existing != options => Err(self.conflict(
                &mut state,
                format!("queue '{}' exists with different properties", name),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        options,
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, _routing_key: &str) -> Result<()> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("no exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("no queue '{}'", queue)));
        }
        state
            .bindings
            .entry(exchange.to_string())
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        _routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        self.ensure_open(&self.shared.lock())?;
        route(&self.shared, exchange, message)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        {
            let state = self.shared.lock();
            self.ensure_open(&state)?;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::NotFound(format!("no queue '{}'", queue)));
            }
        }

        let changed_rx = self.shared.changed.subscribe();
        let seed = (Arc::clone(&self.shared), self.id, queue.to_string(), changed_rx);

        let stream = futures::stream::unfold(
            seed,
            |(shared, channel, queue, mut changed_rx)| async move {
                loop {
                    changed_rx.borrow_and_update();
                    if let Some(delivery) = next_delivery(&shared, channel, &queue)? {
                        return Some((Ok(delivery), (shared, channel, queue, changed_rx)));
                    }
                    if changed_rx.changed().await.is_err() {
                        return None;
                    }
                }
            },
        );

        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        self.shared.lock().channel_open(self.id)
    }

    async fn close(&self) -> Result<()> {
        self.shared.lock().close_channel(self.id);
        self.shared.notify();
        Ok(())
    }
}

/// Pop the next message for a consumer.
///
/// `None` ends the stream (channel closed), `Some(None)` means wait.
fn next_delivery(shared: &Arc<Shared>, channel: u64, queue: &str) -> Option<Option<Delivery>> {
    let mut state = shared.lock();
    let (prefetch, held) = match state.channels.get(&channel) {
        Some(c) => (c.prefetch, c.unacked.len()),
        None => return None,
    };
    if prefetch > 0 && held >= prefetch as usize {
        return Some(None);
    }
    let message = match state.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) {
        Some(message) => message,
        None => return Some(None),
    };

    let tag = state.next_id();
    if let Some(c) = state.channels.get_mut(&channel) {
        c.unacked.insert(tag, (queue.to_string(), message.clone()));
    }
    state.stats.delivered += 1;

    Some(Some(Delivery::new(
        message.body,
        message.message_id,
        message.redelivered,
        Box::new(MemoryAcker {
            shared: Arc::clone(shared),
            channel,
            tag,
        }),
    )))
}

struct MemoryAcker {
    shared: Arc<Shared>,
    channel: u64,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        {
            let mut state = self.shared.lock();
            let (queue, mut message) = state
                .channels
                .get_mut(&self.channel)
                .ok_or_else(|| BrokerError::Closed("channel closed".to_string()))?
                .unacked
                .remove(&self.tag)
                .ok_or_else(|| BrokerError::Ack(format!("unknown delivery tag {}", self.tag)))?;

            match requeue {
                None => state.stats.acked += 1,
                Some(requeue) => {
                    state.stats.nacked += 1;
                    if requeue {
                        if let Some(q) = state.queues.get_mut(&queue) {
                            message.redelivered = true;
                            q.ready.push_front(message);
                        }
                        state.stats.requeued += 1;
                    }
                }
            }
        }
        self.shared.notify();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}

#[cfg(test)]
mod tests;
