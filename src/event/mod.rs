//! Log event data model.
//!
//! A [`LogEvent`] is built once at the front door and never mutated after.
//! It is encoded as JSON for the broker and decoded back into the same
//! shape by consumers before it is handed to the document store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::proto::LogRequest;

/// Content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A single structured event submitted by an upstream service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    service_name: String,
    event_type: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    severity: i32,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl LogEvent {
    /// Start building an event for a service.
    pub fn builder(
        service_name: impl Into<String>,
        event_type: impl Into<String>,
    ) -> LogEventBuilder {
        LogEventBuilder {
            service_name: service_name.into(),
            event_type: event_type.into(),
            user_id: String::new(),
            description: String::new(),
            severity: 0,
            timestamp: None,
            metadata: HashMap::new(),
        }
    }

    /// Build an event from an RPC request.
    ///
    /// An unparsable timestamp is replaced with the current time.
    pub fn from_request(request: LogRequest) -> Self {
        let timestamp = match parse_timestamp(&request.timestamp) {
            Some(ts) => ts,
            None => {
                warn!(
                    service_name = %request.service_name,
                    timestamp = %request.timestamp,
                    "Unparsable timestamp, using current time"
                );
                Utc::now()
            }
        };

        Self {
            service_name: request.service_name,
            event_type: request.event_type,
            user_id: request.user_id,
            description: request.description,
            severity: request.severity,
            timestamp,
            metadata: request.metadata,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn severity(&self) -> i32 {
        self.severity
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Serialize for transport.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a transport body.
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Builder for [`LogEvent`].
#[derive(Debug, Clone)]
pub struct LogEventBuilder {
    service_name: String,
    event_type: String,
    user_id: String,
    description: String,
    severity: i32,
    timestamp: Option<DateTime<Utc>>,
    metadata: HashMap<String, String>,
}

impl LogEventBuilder {
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn severity(mut self, severity: i32) -> Self {
        self.severity = severity;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Finish the event. Timestamp defaults to now.
    pub fn build(self) -> LogEvent {
        LogEvent {
            service_name: self.service_name,
            event_type: self.event_type,
            user_id: self.user_id,
            description: self.description,
            severity: self.severity,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            metadata: self.metadata,
        }
    }
}

/// Parse an RFC3339 timestamp into UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
