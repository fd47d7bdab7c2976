use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::pipeline::types::GenerationStatus;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    pub credits: i64,
    pub total_generated: i64,
    pub last_generation_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct GenerationRow {
    pub id: i64,
    pub user_id: String,
    pub mode: String,
    pub quality: String,
    pub priority: String,
    pub status: String,
    pub image_count: i64,
    pub credits_used: i64,
    pub result_count: Option<i64>,
    pub error_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationRow {
    pub fn status(&self) -> Option<GenerationStatus> {
        GenerationStatus::parse(&self.status)
    }

    /// Canonical status name, or the stored text when it is not a known status.
    pub fn status_label(&self) -> &str {
        self.status()
            .map(GenerationStatus::as_str)
            .unwrap_or(self.status.as_str())
    }
}
