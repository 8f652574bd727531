//! Producer-side client for the ingestion service.
//!
//! Upstream services (auth, map_coloring, map_storage) hold one
//! [`LoggerClient`] tagged with their service name and submit events with
//! the current time as an RFC3339 timestamp.

use std::collections::HashMap;
use std::time::Duration;

use backon::Retryable;
use chrono::{SecondsFormat, Utc};
use tonic::transport::{Channel, Endpoint};
use tracing::warn;

use crate::proto::logger_service_client::LoggerServiceClient;
use crate::proto::{LogRequest, LogResponse};
use crate::utils::retry::{client_backoff, is_retryable_status};

/// Per-call deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Severity attached to every submission.
pub const DEFAULT_SEVERITY: i32 = 1;

/// Errors returned by [`LoggerClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid logger address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Logger call failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("Log rejected: {0}")]
    Rejected(String),
}

/// Submits events to the `LoggerService` on behalf of one service.
#[derive(Clone)]
pub struct LoggerClient {
    inner: LoggerServiceClient<Channel>,
    service_name: String,
}

impl LoggerClient {
    /// Client for `address` ("host:port"). The connection is opened on first use.
    pub fn connect(address: &str, service_name: &str) -> Result<Self, ClientError> {
        Self::with_timeout(address, service_name, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        address: &str,
        service_name: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", address))
            .map_err(|e| ClientError::InvalidAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })?
            .connect_timeout(timeout)
            .timeout(timeout);

        Ok(Self {
            inner: LoggerServiceClient::new(endpoint.connect_lazy()),
            service_name: service_name.to_string(),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Submit one event. Retries while the service is unavailable.
    pub async fn log_event(
        &self,
        event_type: &str,
        user_id: &str,
        description: &str,
        metadata: HashMap<String, String>,
    ) -> Result<(), ClientError> {
        let request = LogRequest {
            service_name: self.service_name.clone(),
            event_type: event_type.to_string(),
            user_id: user_id.to_string(),
            description: description.to_string(),
            severity: DEFAULT_SEVERITY,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            metadata,
        };

        let response = self.send(request).await?;
        if response.success {
            Ok(())
        } else {
            Err(ClientError::Rejected(response.message))
        }
    }

    async fn send(&self, request: LogRequest) -> Result<LogResponse, ClientError> {
        let response = (|| {
            let mut client = self.inner.clone();
            let request = request.clone();
            async move { client.log_event(request).await }
        })
        .retry(client_backoff())
        .when(is_retryable_status)
        .notify(|status: &tonic::Status, delay: Duration| {
            warn!(
                service_name = %self.service_name,
                error = %status,
                delay = ?delay,
                "Logger unavailable, retrying"
            );
        })
        .await?;

        Ok(response.into_inner())
    }
}
