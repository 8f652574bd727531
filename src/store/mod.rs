//! Document store for ingested events.
//!
//! Insert-only: the pipeline never reads back or updates what it wrote.
//!
//! Implementations:
//! - `MongoLogStore`: MongoDB collection (feature `mongodb`)
//! - `MemoryLogStore`: in-process, with failure injection for tests

use async_trait::async_trait;

use crate::event::LogEvent;

#[cfg(feature = "mongodb")]
pub mod mongodb;
pub mod memory;

#[cfg(feature = "mongodb")]
pub use self::mongodb::MongoLogStore;
pub use memory::{MemoryLogStore, StoredLog};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Insert failed: {0}")]
    Insert(String),

    /// The store refused this document. Retrying the same body fails again.
    #[error("Document rejected: {0}")]
    Rejected(String),

    #[cfg(feature = "mongodb")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] ::mongodb::error::Error),
}

impl StoreError {
    /// Whether the failure is about the store rather than the document.
    ///
    /// Transient failures clear on their own; the consumer requeues them
    /// without spending the redelivery budget.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Insert(_) => true,
            StoreError::Rejected(_) => false,
            #[cfg(feature = "mongodb")]
            StoreError::Mongo(e) => {
                use ::mongodb::error::{ErrorKind, WriteFailure};
                !matches!(
                    *e.kind,
                    ErrorKind::Write(WriteFailure::WriteError(_))
                        | ErrorKind::InvalidArgument { .. }
                        | ErrorKind::BsonSerialization(_)
                )
            }
        }
    }
}

/// Persists log events.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Insert one event, returning the id the store assigned.
    async fn insert(&self, event: &LogEvent) -> Result<String>;
}
