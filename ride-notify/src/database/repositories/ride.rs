//! Ride repository.
//!
//! Writes go through the `ride` table; its triggers append to `ride_change`,
//! which the change feed tails.

use async_trait::async_trait;
use ride_status::StatusSpace;
use sqlx::SqlitePool;

use crate::database::models::{RideChangeDbModel, RideDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::{Error, Result};

#[async_trait]
pub trait RideRepository: Send + Sync {
    async fn insert_ride(&self, ride: &RideDbModel) -> Result<()>;
    async fn find_ride(&self, id: &str) -> Result<Option<RideDbModel>>;
    async fn update_ride(&self, ride: &RideDbModel) -> Result<()>;

    /// Set one status field, recording who made the change.
    async fn set_status(
        &self,
        id: &str,
        space: StatusSpace,
        code: i32,
        updated_by: Option<&str>,
    ) -> Result<()>;
    async fn assign_driver(&self, id: &str, driver_id: &str) -> Result<()>;

    /// Rides whose pickup falls within `[from_ms, to_ms]`.
    async fn list_with_pickup_between(&self, from_ms: i64, to_ms: i64)
    -> Result<Vec<RideDbModel>>;

    /// Change log entries with id greater than `after_id`, oldest first.
    async fn list_changes_after(&self, after_id: i64, limit: i64)
    -> Result<Vec<RideChangeDbModel>>;

    /// Delete change log entries with id up to and including `through_id`.
    /// Ids are never reused, so resume tokens stay valid.
    async fn delete_changes_through(&self, through_id: i64) -> Result<u64>;
}

/// SQLx implementation of [`RideRepository`].
pub struct SqlxRideRepository {
    pool: SqlitePool,
}

impl SqlxRideRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RideRepository for SqlxRideRepository {
    async fn insert_ride(&self, ride: &RideDbModel) -> Result<()> {
        retry_on_sqlite_busy("insert_ride", || async {
            sqlx::query(
                r#"
                INSERT INTO ride (
                    id, rider_id, driver_id, emergency_contact_id, progress_status,
                    workflow_status, pickup_address, pickup_at, notes, updated_by,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&ride.id)
            .bind(&ride.rider_id)
            .bind(&ride.driver_id)
            .bind(&ride.emergency_contact_id)
            .bind(ride.progress_status)
            .bind(ride.workflow_status)
            .bind(&ride.pickup_address)
            .bind(ride.pickup_at)
            .bind(&ride.notes)
            .bind(&ride.updated_by)
            .bind(ride.created_at)
            .bind(ride.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn find_ride(&self, id: &str) -> Result<Option<RideDbModel>> {
        let ride = sqlx::query_as::<_, RideDbModel>("SELECT * FROM ride WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(ride)
    }

    async fn update_ride(&self, ride: &RideDbModel) -> Result<()> {
        let affected = retry_on_sqlite_busy("update_ride", || async {
            let result = sqlx::query(
                r#"
                UPDATE ride SET
                    rider_id = ?,
                    driver_id = ?,
                    emergency_contact_id = ?,
                    progress_status = ?,
                    workflow_status = ?,
                    pickup_address = ?,
                    pickup_at = ?,
                    notes = ?,
                    updated_by = ?,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&ride.rider_id)
            .bind(&ride.driver_id)
            .bind(&ride.emergency_contact_id)
            .bind(ride.progress_status)
            .bind(ride.workflow_status)
            .bind(&ride.pickup_address)
            .bind(ride.pickup_at)
            .bind(&ride.notes)
            .bind(&ride.updated_by)
            .bind(now_ms())
            .bind(&ride.id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(Error::not_found("Ride", &ride.id));
        }
        Ok(())
    }

    async fn set_status(
        &self,
        id: &str,
        space: StatusSpace,
        code: i32,
        updated_by: Option<&str>,
    ) -> Result<()> {
        // Column name comes from a closed enum, never from input.
        let sql = format!(
            "UPDATE ride SET {} = ?, updated_by = ?, updated_at = ? WHERE id = ?",
            space.field_name()
        );
        let affected = retry_on_sqlite_busy("set_ride_status", || async {
            let result = sqlx::query(&sql)
                .bind(code)
                .bind(updated_by)
                .bind(now_ms())
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(Error::not_found("Ride", id));
        }
        Ok(())
    }

    async fn assign_driver(&self, id: &str, driver_id: &str) -> Result<()> {
        let affected = retry_on_sqlite_busy("assign_driver", || async {
            let result =
                sqlx::query("UPDATE ride SET driver_id = ?, updated_at = ? WHERE id = ?")
                    .bind(driver_id)
                    .bind(now_ms())
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(Error::not_found("Ride", id));
        }
        Ok(())
    }

    async fn list_with_pickup_between(
        &self,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<RideDbModel>> {
        let rides = sqlx::query_as::<_, RideDbModel>(
            "SELECT * FROM ride WHERE pickup_at BETWEEN ? AND ? ORDER BY pickup_at ASC",
        )
        .bind(from_ms)
        .bind(to_ms)
        .fetch_all(&self.pool)
        .await?;
        Ok(rides)
    }

    async fn list_changes_after(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<RideChangeDbModel>> {
        let changes = sqlx::query_as::<_, RideChangeDbModel>(
            r#"
            SELECT id, op, ride_id, old_values, new_values, created_at
            FROM ride_change
            WHERE id > ?
            ORDER BY id ASC
            LIMIT ?
            "#,
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(changes)
    }

    async fn delete_changes_through(&self, through_id: i64) -> Result<u64> {
        retry_on_sqlite_busy("delete_changes_through", || async {
            let result = sqlx::query("DELETE FROM ride_change WHERE id <= ?")
                .bind(through_id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await
    }
}
