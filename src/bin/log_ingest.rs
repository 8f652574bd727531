//! log-ingest: log ingestion service
//!
//! Accepts `LogEvent` RPCs, fans them out through RabbitMQ and persists
//! them to MongoDB.
//!
//! ## Architecture
//! ```text
//! [auth | map_coloring | map_storage] --(LoggerService gRPC)--> [log-ingest]
//!                                                                    |
//!                                             {source}_logs exchange v
//!                                                 {source}_logs_queue --> MongoDB
//! ```
//!
//! ## Configuration
//! - LOG_INGEST_CONFIG: path to a YAML config file (optional)
//! - LOG_INGEST__SECTION__KEY: override any config key
//! - RABBITMQ_URI, MONGO_URI, PORT: deployment shorthands
//! - LOG_INGEST_LOG / LOG_INGEST_LOG_FORMAT: log filter and format

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use log_ingest::broker::AmqpBroker;
use log_ingest::config::Config;
use log_ingest::pipeline::{serve, Pipeline, PipelineSettings};
use log_ingest::store::MongoLogStore;
use log_ingest::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    info!(
        port = config.server.port,
        database = %config.store.database,
        "log-ingest starting"
    );

    let store = match MongoLogStore::connect(
        &config.store.uri,
        &config.store.database,
        &config.store.collection,
        config.store.connect_timeout(),
    )
    .await
    {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to connect to MongoDB");
            return Err(e.into());
        }
    };

    let broker = Arc::new(AmqpBroker::new(config.broker.uri.clone()));
    let pipeline = Pipeline::start(broker, Arc::new(store), PipelineSettings::from(&config)).await?;

    let listener = TcpListener::bind(config.server.addr()?).await?;
    let stopped = pipeline.shutdown_signal();
    let served = serve(listener, pipeline.service(), async move {
        tokio::select! {
            () = shutdown_signal() => {}
            () = stopped.cancelled() => error!("Pipeline stopped, closing listener"),
        }
    })
    .await;

    let drained = pipeline.shutdown().await;
    served?;
    drained?;

    info!("log-ingest stopped");
    Ok(())
}
