use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db::models::{GenerationRow, UserRow};
use crate::pipeline::ledger::{
    CreditLedger, GenerationStore, NewGeneration, RecordId, StatusUpdate, StoreError,
};
use crate::pipeline::types::GenerationStatus;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn init(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (\
                id TEXT PRIMARY KEY,\
                credits INTEGER NOT NULL DEFAULT 0,\
                total_generated INTEGER NOT NULL DEFAULT 0,\
                last_generation_at TEXT,\
                created_at TEXT NOT NULL,\
                updated_at TEXT NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS generations (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                user_id TEXT NOT NULL,\
                mode TEXT NOT NULL,\
                quality TEXT NOT NULL,\
                priority TEXT NOT NULL,\
                status TEXT NOT NULL DEFAULT 'queued',\
                image_count INTEGER NOT NULL,\
                credits_used INTEGER NOT NULL DEFAULT 0,\
                result_count INTEGER,\
                error_message TEXT,\
                queued_at TEXT NOT NULL,\
                started_at TEXT,\
                completed_at TEXT,\
                FOREIGN KEY(user_id) REFERENCES users(id)\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_generations_user_queued ON generations(user_id, queued_at);",
        )
        .execute(&pool)
        .await?;

        info!("Database tables created successfully");
        Ok(Database { pool })
    }

    pub async fn user(&self, user_id: &str) -> Result<Option<UserRow>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, credits, total_generated, last_generation_at, created_at, updated_at \
             FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64, StoreError> {
        self.user(user_id)
            .await?
            .map(|user| user.credits)
            .ok_or_else(|| StoreError::UnknownUser(user_id.to_string()))
    }

    /// Adds credits, creating the account on first grant. Returns the new balance.
    pub async fn grant_credits(&self, user_id: &str, amount: i64) -> Result<i64, StoreError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (id, credits, created_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             credits = credits + excluded.credits, \
             updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(amount)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let balance = self.balance(user_id).await?;
        info!("Granted {} credit(s) to {} (balance {})", amount, user_id, balance);
        Ok(balance)
    }

    pub async fn recent_generations(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<GenerationRow>, StoreError> {
        let rows = sqlx::query_as::<_, GenerationRow>(
            "SELECT id, user_id, mode, quality, priority, status, image_count, credits_used, \
             result_count, error_message, queued_at, started_at, completed_at \
             FROM generations WHERE user_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn generation(&self, id: RecordId) -> Result<Option<GenerationRow>, StoreError> {
        let row = sqlx::query_as::<_, GenerationRow>(
            "SELECT id, user_id, mode, quality, priority, status, image_count, credits_used, \
             result_count, error_message, queued_at, started_at, completed_at \
             FROM generations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

#[async_trait]
impl CreditLedger for Database {
    async fn credits(&self, user_id: &str) -> Result<i64, StoreError> {
        let credits: Option<i64> = sqlx::query_scalar("SELECT credits FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(credits.unwrap_or(0))
    }

    async fn debit(&self, user_id: &str, amount: i64) -> Result<bool, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE users SET \
             credits = credits - ?, \
             total_generated = total_generated + 1, \
             last_generation_at = ?, \
             updated_at = ? \
             WHERE id = ? AND credits >= ?",
        )
        .bind(amount)
        .bind(now)
        .bind(now)
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        let applied = result.rows_affected() == 1;
        debug!(
            "Debit of {} credit(s) from {}: applied={}",
            amount, user_id, applied
        );
        Ok(applied)
    }
}

#[async_trait]
impl GenerationStore for Database {
    async fn create(&self, generation: NewGeneration<'_>) -> Result<RecordId, StoreError> {
        let result = sqlx::query(
            "INSERT INTO generations \
             (user_id, mode, quality, priority, status, image_count, credits_used, queued_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(generation.user_id)
        .bind(generation.mode.as_str())
        .bind(generation.quality.as_str())
        .bind(generation.priority.as_str())
        .bind(GenerationStatus::Queued.as_str())
        .bind(generation.image_count as i64)
        .bind(generation.image_count as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        info!(
            "Created generation record {} for {} ({} x{})",
            id,
            generation.user_id,
            generation.mode.as_str(),
            generation.image_count
        );
        Ok(id)
    }

    async fn update_status(&self, id: RecordId, update: StatusUpdate) -> Result<(), StoreError> {
        let now = Utc::now();
        let started_at = (update.status == GenerationStatus::Processing).then_some(now);
        let completed_at = update.status.is_terminal().then_some(now);
        let result_count = update.result_count.map(|count| count as i64);
        let credits_used = if update.status.is_terminal() {
            result_count
        } else {
            None
        };

        let result = sqlx::query(
            "UPDATE generations SET \
             status = ?, \
             result_count = COALESCE(?, result_count), \
             credits_used = COALESCE(?, credits_used), \
             error_message = COALESCE(?, error_message), \
             started_at = COALESCE(started_at, ?), \
             completed_at = COALESCE(?, completed_at) \
             WHERE id = ?",
        )
        .bind(update.status.as_str())
        .bind(result_count)
        .bind(credits_used)
        .bind(update.error_message.as_deref())
        .bind(started_at)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownRecord(id));
        }
        debug!("Generation record {} -> {}", id, update.status.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{GenerationMode, Priority, Quality};

    async fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("studio.db").display());
        let db = Database::init(&url).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn debit_never_drives_balance_negative() {
        let (_dir, db) = open().await;
        assert_eq!(db.credits("bob").await.unwrap(), 0);
        assert!(matches!(
            db.balance("bob").await,
            Err(StoreError::UnknownUser(_))
        ));

        assert_eq!(db.grant_credits("bob", 2).await.unwrap(), 2);
        assert_eq!(db.credits("bob").await.unwrap(), 2);

        assert!(db.debit("bob", 1).await.unwrap());
        assert!(db.debit("bob", 1).await.unwrap());
        assert!(!db.debit("bob", 1).await.unwrap());

        let user = db.user("bob").await.unwrap().unwrap();
        assert_eq!(user.credits, 0);
        assert_eq!(user.total_generated, 2);
        assert!(user.last_generation_at.is_some());

        assert_eq!(db.grant_credits("bob", 5).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn generation_records_track_lifecycle_timestamps() {
        let (_dir, db) = open().await;
        db.grant_credits("carol", 3).await.unwrap();
        let id = db
            .create(NewGeneration {
                user_id: "carol",
                mode: GenerationMode::Selfie,
                image_count: 3,
                quality: Quality::Hd,
                priority: Priority::Normal,
            })
            .await
            .unwrap();

        let row = db.generation(id).await.unwrap().unwrap();
        assert_eq!(row.status(), Some(GenerationStatus::Queued));
        assert_eq!(row.mode, "selfie");
        assert_eq!(row.quality, "hd");
        assert!(row.started_at.is_none());

        db.update_status(id, StatusUpdate::new(GenerationStatus::Processing))
            .await
            .unwrap();
        let row = db.generation(id).await.unwrap().unwrap();
        assert!(row.started_at.is_some());
        assert!(row.completed_at.is_none());

        db.update_status(
            id,
            StatusUpdate::new(GenerationStatus::Failed)
                .with_result_count(1)
                .with_error("quota exhausted"),
        )
        .await
        .unwrap();
        let row = db.generation(id).await.unwrap().unwrap();
        assert_eq!(row.status(), Some(GenerationStatus::Failed));
        assert_eq!(row.result_count, Some(1));
        assert_eq!(row.credits_used, 1);
        assert_eq!(row.error_message.as_deref(), Some("quota exhausted"));
        assert!(row.completed_at.is_some());

        let recent = db.recent_generations("carol", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, id);

        assert!(matches!(
            db.update_status(999, StatusUpdate::new(GenerationStatus::Completed))
                .await,
            Err(StoreError::UnknownRecord(999))
        ));
    }
}
