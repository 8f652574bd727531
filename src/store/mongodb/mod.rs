//! MongoDB LogStore implementation.

use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, DateTime as BsonDateTime, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, Database};
use tracing::{debug, info};

use crate::event::LogEvent;
use crate::store::{LogStore, Result, StoreError};

/// MongoDB implementation of LogStore.
pub struct MongoLogStore {
    logs: Collection<Document>,
}

impl MongoLogStore {
    /// Connect and ping, failing if the server does not answer within `timeout`.
    pub async fn connect(
        uri: &str,
        database_name: &str,
        collection: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut options = ClientOptions::parse(uri).await?;
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);
        let client = Client::with_options(options)?;

        let database = client.database(database_name);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!(database = %database_name, collection = %collection, "Connected to MongoDB");
        Ok(Self::new(&database, collection))
    }

    pub fn new(database: &Database, collection: &str) -> Self {
        Self {
            logs: database.collection(collection),
        }
    }
}

/// Document layout: the JSON field names, with a BSON datetime timestamp.
fn to_document(event: &LogEvent) -> Document {
    let metadata: Document = event
        .metadata()
        .iter()
        .map(|(k, v)| (k.clone(), Bson::String(v.clone())))
        .collect();

    doc! {
        "service_name": event.service_name(),
        "event_type": event.event_type(),
        "user_id": event.user_id(),
        "description": event.description(),
        "severity": event.severity(),
        "timestamp": BsonDateTime::from_millis(event.timestamp().timestamp_millis()),
        "metadata": metadata,
    }
}

#[async_trait]
impl LogStore for MongoLogStore {
    async fn insert(&self, event: &LogEvent) -> Result<String> {
        let result = self.logs.insert_one(to_document(event)).await?;
        let id = match result.inserted_id {
            Bson::ObjectId(id) => id.to_hex(),
            other => other.to_string(),
        };
        debug!(id = %id, service_name = %event.service_name(), "Log inserted");
        Ok(id)
    }
}
