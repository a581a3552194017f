//! Ride document as seen by the notification pipeline.

use chrono::{DateTime, Utc};
use ride_status::{RideProgressStatus, RideWorkflowStatus, StatusSpace};
use serde::{Deserialize, Serialize};

/// Current state of a ride record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideDocument {
    pub id: String,
    pub rider_id: String,
    pub driver_id: Option<String>,
    pub emergency_contact_id: Option<String>,
    pub progress_status: RideProgressStatus,
    pub workflow_status: RideWorkflowStatus,
    pub pickup_address: Option<String>,
    pub pickup_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RideDocument {
    pub fn new(id: impl Into<String>, rider_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            rider_id: rider_id.into(),
            driver_id: None,
            emergency_contact_id: None,
            progress_status: RideProgressStatus::RequestInProgress,
            workflow_status: RideWorkflowStatus::Submitted,
            pickup_address: None,
            pickup_at: None,
            notes: None,
            updated_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status_code(&self, space: StatusSpace) -> i32 {
        match space {
            StatusSpace::Progress => self.progress_status.code(),
            StatusSpace::Workflow => self.workflow_status.code(),
        }
    }

    /// Whether the ride is still expected to happen: not cancelled or
    /// denied, and the rider has not been picked up yet.
    pub fn awaiting_pickup(&self) -> bool {
        !self.workflow_status.is_cancelled()
            && self.workflow_status != RideWorkflowStatus::Denied
            && self.progress_status.is_before_pickup()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_awaiting_pickup() {
        let mut ride = RideDocument::new("ride-1", "rider-1");
        assert!(ride.awaiting_pickup());

        ride.progress_status = RideProgressStatus::PickedUp;
        assert!(!ride.awaiting_pickup());

        ride.progress_status = RideProgressStatus::Scheduled;
        ride.workflow_status = RideWorkflowStatus::CancelledByRider;
        assert!(!ride.awaiting_pickup());
    }

    #[test]
    fn test_status_code_by_space() {
        let ride = RideDocument::new("ride-1", "rider-1");
        assert_eq!(ride.status_code(StatusSpace::Progress), 0);
        assert_eq!(ride.status_code(StatusSpace::Workflow), 100);
    }
}
