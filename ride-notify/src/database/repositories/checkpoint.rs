//! Change feed checkpoint repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::Result;
use crate::database::models::ChangeFeedCheckpointDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;

#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn load_checkpoint(&self, subscription: &str) -> Result<Option<String>>;
    async fn save_checkpoint(&self, subscription: &str, resume_token: &str) -> Result<()>;
    async fn list_checkpoints(&self) -> Result<Vec<ChangeFeedCheckpointDbModel>>;
}

/// SQLx implementation of [`CheckpointRepository`].
pub struct SqlxCheckpointRepository {
    pool: SqlitePool,
}

impl SqlxCheckpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CheckpointRepository for SqlxCheckpointRepository {
    async fn load_checkpoint(&self, subscription: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT resume_token FROM change_feed_checkpoint WHERE subscription = ?",
        )
        .bind(subscription)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(token,)| token))
    }

    async fn save_checkpoint(&self, subscription: &str, resume_token: &str) -> Result<()> {
        retry_on_sqlite_busy("save_checkpoint", || async {
            sqlx::query(
                r#"
                INSERT INTO change_feed_checkpoint (subscription, resume_token, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(subscription) DO UPDATE SET
                    resume_token = excluded.resume_token,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(subscription)
            .bind(resume_token)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_checkpoints(&self) -> Result<Vec<ChangeFeedCheckpointDbModel>> {
        let rows = sqlx::query_as::<_, ChangeFeedCheckpointDbModel>(
            "SELECT subscription, resume_token, updated_at FROM change_feed_checkpoint ORDER BY subscription",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;

    #[tokio::test]
    async fn test_checkpoint_upsert() {
        let repo = SqlxCheckpointRepository::new(init_memory_pool().await.unwrap());
        assert_eq!(repo.load_checkpoint("progress_status").await.unwrap(), None);

        repo.save_checkpoint("progress_status", "4").await.unwrap();
        repo.save_checkpoint("progress_status", "9").await.unwrap();

        assert_eq!(
            repo.load_checkpoint("progress_status").await.unwrap(),
            Some("9".to_string())
        );
        assert_eq!(repo.list_checkpoints().await.unwrap().len(), 1);
    }
}
