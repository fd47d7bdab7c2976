use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::types::{GenerationMode, GenerationStatus, Priority, Quality};

pub type RecordId = i64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Unknown user {0}")]
    UnknownUser(String),
    #[error("Unknown generation record {0}")]
    UnknownRecord(RecordId),
}

/// Per-user credit balance. `debit` must be an atomic
/// decrement-if-available: it returns `false` instead of going negative.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Current balance; an unknown user has none.
    async fn credits(&self, user_id: &str) -> Result<i64, StoreError>;

    async fn debit(&self, user_id: &str, amount: i64) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewGeneration<'a> {
    pub user_id: &'a str,
    pub mode: GenerationMode,
    pub image_count: usize,
    pub quality: Quality,
    pub priority: Priority,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: GenerationStatus,
    pub result_count: Option<usize>,
    pub error_message: Option<String>,
}

impl StatusUpdate {
    pub fn new(status: GenerationStatus) -> Self {
        Self {
            status,
            result_count: None,
            error_message: None,
        }
    }

    pub fn with_result_count(mut self, count: usize) -> Self {
        self.result_count = Some(count);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[async_trait]
pub trait GenerationStore: Send + Sync {
    async fn create(&self, generation: NewGeneration<'_>) -> Result<RecordId, StoreError>;

    async fn update_status(&self, id: RecordId, update: StatusUpdate) -> Result<(), StoreError>;
}
