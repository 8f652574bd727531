//! log-ingest - asynchronous log ingestion
//!
//! Upstream services submit structured log events over gRPC. Each event is
//! published to its source's fan-out exchange and drained from a durable
//! queue into a document store, surviving broker connection loss along
//! the way.

pub mod broker;
pub mod client;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event;
pub mod pipeline;
pub mod publisher;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod topology;
pub mod utils;

pub mod proto {
    tonic::include_proto!("logs");
}
