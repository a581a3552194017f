//! Ride and change-log database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_ms_to_datetime};
use crate::domain::RideDocument;

/// Row of the `ride` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RideDbModel {
    pub id: String,
    pub rider_id: String,
    pub driver_id: Option<String>,
    pub emergency_contact_id: Option<String>,
    pub progress_status: i64,
    pub workflow_status: i64,
    pub pickup_address: Option<String>,
    pub pickup_at: Option<i64>,
    pub notes: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl From<RideDbModel> for RideDocument {
    fn from(row: RideDbModel) -> Self {
        Self {
            id: row.id,
            rider_id: row.rider_id,
            driver_id: row.driver_id,
            emergency_contact_id: row.emergency_contact_id,
            progress_status: status_code(row.progress_status).into(),
            workflow_status: status_code(row.workflow_status).into(),
            pickup_address: row.pickup_address,
            pickup_at: opt_ms_to_datetime(row.pickup_at),
            notes: row.notes,
            updated_by: row.updated_by,
            created_at: ms_to_datetime(row.created_at),
            updated_at: ms_to_datetime(row.updated_at),
        }
    }
}

impl From<&RideDocument> for RideDbModel {
    fn from(doc: &RideDocument) -> Self {
        Self {
            id: doc.id.clone(),
            rider_id: doc.rider_id.clone(),
            driver_id: doc.driver_id.clone(),
            emergency_contact_id: doc.emergency_contact_id.clone(),
            progress_status: i64::from(doc.progress_status.code()),
            workflow_status: i64::from(doc.workflow_status.code()),
            pickup_address: doc.pickup_address.clone(),
            pickup_at: doc.pickup_at.map(datetime_to_ms),
            notes: doc.notes.clone(),
            updated_by: doc.updated_by.clone(),
            created_at: datetime_to_ms(doc.created_at),
            updated_at: datetime_to_ms(doc.updated_at),
        }
    }
}

/// Codes outside `i32` cannot be meaningful in either space.
fn status_code(raw: i64) -> i32 {
    i32::try_from(raw).unwrap_or(i32::MIN)
}

/// Row of the trigger-fed `ride_change` log.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RideChangeDbModel {
    pub id: i64,
    /// `insert` or `update`.
    pub op: String,
    pub ride_id: String,
    /// JSON object of tracked fields before the write; `NULL` for inserts.
    pub old_values: Option<String>,
    /// JSON object of tracked fields after the write.
    pub new_values: String,
    pub created_at: i64,
}
