//! Publishes log events to their source's exchange.
//!
//! Each publish fetches the current connection, opens a channel for that
//! one message, and closes it again whatever the outcome. Without a live
//! connection the call fails at once rather than waiting for recovery.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::{BrokerError, OutboundMessage};
use crate::event::{LogEvent, CONTENT_TYPE_JSON};
use crate::supervisor::ConnectionHandle;
use crate::topology::{Topology, ROUTING_KEY};

/// Errors returned by [`Publisher::publish`].
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("No live broker connection")]
    NoConnection,

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Routes events to exchanges over the supervised connection.
#[derive(Clone)]
pub struct Publisher {
    connection: ConnectionHandle,
    topology: Arc<Topology>,
}

impl Publisher {
    pub fn new(connection: ConnectionHandle, topology: Arc<Topology>) -> Self {
        Self {
            connection,
            topology,
        }
    }

    /// Publish one event. Returns the message id stamped on it.
    #[tracing::instrument(
        name = "publisher.publish",
        skip_all,
        fields(service_name = %event.service_name(), exchange = tracing::field::Empty)
    )]
    pub async fn publish(&self, event: &LogEvent) -> Result<String, PublishError> {
        let exchange = self.topology.exchange_for(event.service_name());
        tracing::Span::current().record("exchange", exchange);

        let conn = self.connection.current().ok_or(PublishError::NoConnection)?;
        let body = event.to_json()?;
        let message_id = Uuid::new_v4().to_string();

        let channel = conn.create_channel().await?;
        let result = channel
            .publish(
                exchange,
                ROUTING_KEY,
                OutboundMessage {
                    body,
                    content_type: CONTENT_TYPE_JSON.to_string(),
                    message_id: Some(message_id.clone()),
                    persistent: true,
                },
            )
            .await;

        if let Err(e) = channel.close().await {
            warn!(error = %e, "Failed to close publish channel");
        }
        result?;

        debug!(message_id = %message_id, "Event published");
        Ok(message_id)
    }
}
