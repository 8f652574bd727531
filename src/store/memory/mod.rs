//! In-memory LogStore implementation for testing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::event::LogEvent;
use crate::store::{LogStore, Result, StoreError};

/// A persisted event with its assigned id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredLog {
    pub id: String,
    pub event: LogEvent,
}

/// Log store that keeps documents in memory.
#[derive(Default)]
pub struct MemoryLogStore {
    documents: RwLock<Vec<StoredLog>>,
    fail_next: RwLock<u32>,
    fail_always: RwLock<bool>,
    reject_next: RwLock<u32>,
    reject_always: RwLock<bool>,
    insert_delay: RwLock<Option<Duration>>,
    next_id: AtomicU64,
    attempts: AtomicU64,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` inserts.
    pub async fn fail_next(&self, count: u32) {
        *self.fail_next.write().await = count;
    }

    /// Fail every insert until reset.
    pub async fn set_fail(&self, fail: bool) {
        *self.fail_always.write().await = fail;
    }

    /// Reject the next `count` documents.
    pub async fn reject_next(&self, count: u32) {
        *self.reject_next.write().await = count;
    }

    /// Reject every document until reset.
    pub async fn set_reject(&self, reject: bool) {
        *self.reject_always.write().await = reject;
    }

    /// Make every insert take at least `delay`.
    pub async fn set_insert_delay(&self, delay: Option<Duration>) {
        *self.insert_delay.write().await = delay;
    }

    pub async fn documents(&self) -> Vec<StoredLog> {
        self.documents.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Insert calls so far, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert(&self, event: &LogEvent) -> Result<String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = *self.insert_delay.read().await {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_always.read().await {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        {
            let mut fail_next = self.fail_next.write().await;
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(StoreError::Insert("injected failure".to_string()));
            }
        }
        if *self.reject_always.read().await {
            return Err(StoreError::Rejected("document refused".to_string()));
        }
        {
            let mut reject_next = self.reject_next.write().await;
            if *reject_next > 0 {
                *reject_next -= 1;
                return Err(StoreError::Rejected("document refused".to_string()));
            }
        }

        let id = format!("{:024x}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.documents.write().await.push(StoredLog {
            id: id.clone(),
            event: event.clone(),
        });
        Ok(id)
    }
}
