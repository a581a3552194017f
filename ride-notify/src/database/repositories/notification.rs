//! Notification queue repository.
//!
//! Every state change is a single conditional `UPDATE`. Callers learn whether
//! they won a race from `rows_affected`, never from a prior read.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{NotificationItemDbModel, StatusCounts};
use crate::database::retry::retry_on_sqlite_busy;
use crate::domain::NotificationStatus;
use crate::{Error, Result};

const ITEM_COLUMNS: &str = "id, channel, recipient, message_body, priority, scheduled_at, \
     retry_count, max_retries, status, correlation_id, dedupe_key, provider_message_ref, \
     metadata, last_error, claimed_at, version, created_at, updated_at";

/// Result of inserting a new item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(String),
    /// An item with the same dedupe key already exists.
    Duplicate(String),
}

impl InsertOutcome {
    pub fn id(&self) -> &str {
        match self {
            Self::Inserted(id) | Self::Duplicate(id) => id,
        }
    }
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn insert_item(&self, item: &NotificationItemDbModel) -> Result<InsertOutcome>;
    async fn find_item(&self, id: &str) -> Result<Option<NotificationItemDbModel>>;
    async fn get_item(&self, id: &str) -> Result<NotificationItemDbModel>;

    /// Pending items due at `now_ms`, by priority desc then creation order.
    async fn list_eligible(&self, now_ms: i64, limit: i64)
    -> Result<Vec<NotificationItemDbModel>>;

    /// `pending -> processing` if the item is still pending and due.
    async fn claim_item(&self, id: &str, now_ms: i64) -> Result<bool>;

    /// Overwrite the mutable columns if status and version are unchanged.
    /// Bumps `version` on success.
    async fn update_item_if_unchanged(
        &self,
        item: &NotificationItemDbModel,
        expected_status: NotificationStatus,
        expected_version: i64,
    ) -> Result<bool>;

    /// `pending|processing -> cancelled`.
    async fn cancel_item(&self, id: &str, now_ms: i64) -> Result<bool>;
    async fn cancel_by_correlation(&self, correlation_id: &str, now_ms: i64) -> Result<u64>;

    async fn list_by_correlation(&self, correlation_id: &str)
    -> Result<Vec<NotificationItemDbModel>>;
    async fn find_by_provider_ref(&self, provider_ref: &str)
    -> Result<Option<NotificationItemDbModel>>;

    /// Processing items claimed at or before `claimed_before_ms`.
    async fn list_stale_processing(
        &self,
        claimed_before_ms: i64,
        limit: i64,
    ) -> Result<Vec<NotificationItemDbModel>>;

    async fn count_by_status(&self) -> Result<StatusCounts>;
}

/// SQLx implementation of [`NotificationRepository`].
pub struct SqlxNotificationRepository {
    pool: SqlitePool,
}

impl SqlxNotificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationRepository for SqlxNotificationRepository {
    async fn insert_item(&self, item: &NotificationItemDbModel) -> Result<InsertOutcome> {
        retry_on_sqlite_busy("insert_notification_item", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO notification_item (
                    id, channel, recipient, message_body, priority, scheduled_at,
                    retry_count, max_retries, status, correlation_id, dedupe_key,
                    provider_message_ref, metadata, last_error, claimed_at, version,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(dedupe_key) DO NOTHING
                "#,
            )
            .bind(&item.id)
            .bind(&item.channel)
            .bind(&item.recipient)
            .bind(&item.message_body)
            .bind(item.priority)
            .bind(item.scheduled_at)
            .bind(item.retry_count)
            .bind(item.max_retries)
            .bind(&item.status)
            .bind(&item.correlation_id)
            .bind(&item.dedupe_key)
            .bind(&item.provider_message_ref)
            .bind(&item.metadata)
            .bind(&item.last_error)
            .bind(item.claimed_at)
            .bind(item.version)
            .bind(item.created_at)
            .bind(item.updated_at)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(InsertOutcome::Inserted(item.id.clone()));
            }

            let Some(key) = item.dedupe_key.as_deref() else {
                return Err(Error::Other(format!(
                    "notification {} was not inserted",
                    item.id
                )));
            };
            let existing: Option<(String,)> =
                sqlx::query_as("SELECT id FROM notification_item WHERE dedupe_key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;
            existing
                .map(|(id,)| InsertOutcome::Duplicate(id))
                .ok_or_else(|| Error::not_found("NotificationItem", key))
        })
        .await
    }

    async fn find_item(&self, id: &str) -> Result<Option<NotificationItemDbModel>> {
        let row = sqlx::query_as::<_, NotificationItemDbModel>(&format!(
            "SELECT {ITEM_COLUMNS} FROM notification_item WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_item(&self, id: &str) -> Result<NotificationItemDbModel> {
        self.find_item(id)
            .await?
            .ok_or_else(|| Error::not_found("NotificationItem", id))
    }

    async fn list_eligible(
        &self,
        now_ms: i64,
        limit: i64,
    ) -> Result<Vec<NotificationItemDbModel>> {
        let rows = sqlx::query_as::<_, NotificationItemDbModel>(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM notification_item
            WHERE status = 'pending'
              AND (scheduled_at IS NULL OR scheduled_at <= ?)
            ORDER BY priority DESC, created_at ASC, seq ASC
            LIMIT ?
            "#
        ))
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn claim_item(&self, id: &str, now_ms: i64) -> Result<bool> {
        retry_on_sqlite_busy("claim_notification_item", || async {
            let result = sqlx::query(
                r#"
                UPDATE notification_item
                SET status = 'processing', claimed_at = ?, updated_at = ?, version = version + 1
                WHERE id = ?
                  AND status = 'pending'
                  AND (scheduled_at IS NULL OR scheduled_at <= ?)
                "#,
            )
            .bind(now_ms)
            .bind(now_ms)
            .bind(id)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn update_item_if_unchanged(
        &self,
        item: &NotificationItemDbModel,
        expected_status: NotificationStatus,
        expected_version: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("update_notification_item", || async {
            let result = sqlx::query(
                r#"
                UPDATE notification_item SET
                    status = ?,
                    scheduled_at = ?,
                    retry_count = ?,
                    provider_message_ref = ?,
                    metadata = ?,
                    last_error = ?,
                    claimed_at = ?,
                    updated_at = ?,
                    version = version + 1
                WHERE id = ? AND status = ? AND version = ?
                "#,
            )
            .bind(&item.status)
            .bind(item.scheduled_at)
            .bind(item.retry_count)
            .bind(&item.provider_message_ref)
            .bind(&item.metadata)
            .bind(&item.last_error)
            .bind(item.claimed_at)
            .bind(item.updated_at)
            .bind(&item.id)
            .bind(expected_status.as_str())
            .bind(expected_version)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn cancel_item(&self, id: &str, now_ms: i64) -> Result<bool> {
        retry_on_sqlite_busy("cancel_notification_item", || async {
            let result = sqlx::query(
                r#"
                UPDATE notification_item
                SET status = 'cancelled', updated_at = ?, version = version + 1
                WHERE id = ? AND status IN ('pending', 'processing')
                "#,
            )
            .bind(now_ms)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    async fn cancel_by_correlation(&self, correlation_id: &str, now_ms: i64) -> Result<u64> {
        retry_on_sqlite_busy("cancel_notifications_by_correlation", || async {
            let result = sqlx::query(
                r#"
                UPDATE notification_item
                SET status = 'cancelled', updated_at = ?, version = version + 1
                WHERE correlation_id = ? AND status IN ('pending', 'processing')
                "#,
            )
            .bind(now_ms)
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn list_by_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<NotificationItemDbModel>> {
        let rows = sqlx::query_as::<_, NotificationItemDbModel>(&format!(
            "SELECT {ITEM_COLUMNS} FROM notification_item WHERE correlation_id = ? ORDER BY created_at ASC, seq ASC"
        ))
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<NotificationItemDbModel>> {
        let row = sqlx::query_as::<_, NotificationItemDbModel>(&format!(
            "SELECT {ITEM_COLUMNS} FROM notification_item WHERE provider_message_ref = ? ORDER BY seq DESC LIMIT 1"
        ))
        .bind(provider_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_stale_processing(
        &self,
        claimed_before_ms: i64,
        limit: i64,
    ) -> Result<Vec<NotificationItemDbModel>> {
        let rows = sqlx::query_as::<_, NotificationItemDbModel>(&format!(
            r#"
            SELECT {ITEM_COLUMNS} FROM notification_item
            WHERE status = 'processing'
              AND (claimed_at IS NULL OR claimed_at <= ?)
            ORDER BY claimed_at ASC
            LIMIT ?
            "#
        ))
        .bind(claimed_before_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM notification_item GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            if let Some(status) = NotificationStatus::parse(&status) {
                counts.add(status, u64::try_from(count).unwrap_or(0));
            }
        }
        Ok(counts)
    }
}
