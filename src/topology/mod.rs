//! Broker topology.
//!
//! One durable fan-out exchange per log source (`{source}_logs`), each with
//! its durable queues (`{source}_logs_queue`) bound by an empty routing key.
//! Unknown sources route to the default source's exchange.
//!
//! [`ensure_topology`] declares everything and is safe to repeat: identical
//! redeclarations are no-ops, conflicting ones fail with
//! [`TopologyError::Conflict`], which callers treat as fatal.

use tracing::{debug, info};

use crate::broker::{BrokerChannel, BrokerConnection, BrokerError, DeclareOptions};

/// Sources with their own exchange.
pub const KNOWN_SOURCES: [&str; 3] = ["auth", "map_coloring", "map_storage"];
/// Source whose exchange receives events from unknown services.
pub const DEFAULT_SOURCE: &str = "map_coloring";
/// Exchange receiving messages that exhausted their redelivery budget.
pub const DEAD_LETTER_EXCHANGE: &str = "logs_dead_letter";
pub const DEAD_LETTER_QUEUE: &str = "logs_dead_letter_queue";

/// Fan-out ignores routing keys; bindings and publishes use an empty one.
pub const ROUTING_KEY: &str = "";

/// Exchange name for a source.
pub fn exchange_name(source: &str) -> String {
    format!("{}_logs", source)
}

/// Queue name for a source.
pub fn queue_name(source: &str) -> String {
    format!("{}_logs_queue", source)
}

/// Errors raised while declaring topology.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Topology conflicts with existing broker state: {0}")]
    Conflict(String),

    #[error("Invalid topology: {0}")]
    Invalid(String),

    #[error("Broker error during topology setup: {0}")]
    Broker(BrokerError),
}

impl TopologyError {
    /// Conflicts and invalid descriptors never resolve by retrying.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TopologyError::Broker(_))
    }
}

impl From<BrokerError> for TopologyError {
    fn from(err: BrokerError) -> Self {
        if err.is_conflict() {
            TopologyError::Conflict(err.to_string())
        } else {
            TopologyError::Broker(err)
        }
    }
}

/// One exchange and the queues bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub source: String,
    pub exchange: String,
    pub queues: Vec<String>,
}

impl Route {
    /// Standard route for a source: `{source}_logs` -> `{source}_logs_queue`.
    pub fn for_source(source: &str) -> Self {
        Self {
            source: source.to_string(),
            exchange: exchange_name(source),
            queues: vec![queue_name(source)],
        }
    }
}

/// Source-to-exchange mapping plus the optional dead-letter route.
#[derive(Debug, Clone)]
pub struct Topology {
    routes: Vec<Route>,
    default_source: String,
    dead_letter: Option<Route>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::standard()
    }
}

impl Topology {
    /// The compiled-in topology: auth, map_coloring, map_storage, plus dead-letter.
    pub fn standard() -> Self {
        Self {
            routes: KNOWN_SOURCES.iter().map(|s| Route::for_source(s)).collect(),
            default_source: DEFAULT_SOURCE.to_string(),
            dead_letter: Some(Route {
                source: "dead_letter".to_string(),
                exchange: DEAD_LETTER_EXCHANGE.to_string(),
                queues: vec![DEAD_LETTER_QUEUE.to_string()],
            }),
        }
    }

    /// Build a custom topology. The default source must be one of the routes.
    pub fn new(routes: Vec<Route>, default_source: &str) -> Result<Self, TopologyError> {
        if !routes.iter().any(|r| r.source == default_source) {
            return Err(TopologyError::Invalid(format!(
                "default source '{}' has no route",
                default_source
            )));
        }
        Ok(Self {
            routes,
            default_source: default_source.to_string(),
            dead_letter: None,
        })
    }

    pub fn with_dead_letter(mut self, exchange: &str, queue: &str) -> Self {
        self.dead_letter = Some(Route {
            source: "dead_letter".to_string(),
            exchange: exchange.to_string(),
            queues: vec![queue.to_string()],
        });
        self
    }

    pub fn without_dead_letter(mut self) -> Self {
        self.dead_letter = None;
        self
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn dead_letter(&self) -> Option<&Route> {
        self.dead_letter.as_ref()
    }

    /// Route for a service name, falling back to the default source.
    pub fn route_for(&self, service_name: &str) -> &Route {
        self.routes
            .iter()
            .find(|r| r.source == service_name)
            .or_else(|| self.routes.iter().find(|r| r.source == self.default_source))
            .unwrap_or(&self.routes[0])
    }

    pub fn exchange_for(&self, service_name: &str) -> &str {
        &self.route_for(service_name).exchange
    }

    /// Queues drained into the document store (dead-letter queue excluded).
    pub fn consumer_queues(&self) -> Vec<String> {
        self.routes
            .iter()
            .flat_map(|r| r.queues.iter().cloned())
            .collect()
    }

    fn all_routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().chain(self.dead_letter.iter())
    }
}

/// Declare every exchange, queue, and binding of `topology`.
///
/// Uses its own channel, closed afterwards whatever the outcome.
pub async fn ensure_topology(
    connection: &dyn BrokerConnection,
    topology: &Topology,
) -> Result<(), TopologyError> {
    let channel = connection.create_channel().await?;
    let result = declare_all(channel.as_ref(), topology).await;

    if let Err(e) = channel.close().await {
        // Expected after a conflict: the broker already closed it.
        debug!(error = %e, "Topology channel close failed");
    }

    if result.is_ok() {
        info!(
            exchanges = topology.all_routes().count(),
            "Broker topology ensured"
        );
    }
    result
}

async fn declare_all(channel: &dyn BrokerChannel, topology: &Topology) -> Result<(), TopologyError> {
    for route in topology.all_routes() {
        channel
            .declare_exchange(&route.exchange, DeclareOptions::durable())
            .await?;

        for queue in &route.queues {
            channel
                .declare_queue(queue, DeclareOptions::durable())
                .await?;
            channel
                .bind_queue(queue, &route.exchange, ROUTING_KEY)
                .await?;

            debug!(exchange = %route.exchange, queue = %queue, "Bound queue to exchange");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
