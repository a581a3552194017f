//! Change feed checkpoint database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Last change a subscription has fully processed.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeFeedCheckpointDbModel {
    pub subscription: String,
    pub resume_token: String,
    pub updated_at: i64,
}
