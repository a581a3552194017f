//! Ride status code spaces.
//!
//! A ride record carries two independent integer status fields:
//!
//! - the *progress* status (0–509) tracks the physical trip,
//! - the *workflow* status (100–1100) tracks administrative approval.
//!
//! Both are decoded into tagged enums here. Codes that have no meaning in a
//! space decode to the `Ignored` variant instead of failing, so callers can
//! match exhaustively and decide what "no action" means for them.

use serde::{Deserialize, Serialize};

/// Which of the two status fields a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSpace {
    Progress,
    Workflow,
}

impl StatusSpace {
    /// Name of the document field holding this space's code.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Progress => "progress_status",
            Self::Workflow => "workflow_status",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Workflow => "workflow",
        }
    }
}

impl std::fmt::Display for StatusSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical lifecycle of a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum RideProgressStatus {
    /// 0: the request is still being filled in.
    RequestInProgress,
    /// 100
    Scheduled,
    /// 200: a driver is on the way to the pickup address.
    DriverEnRoute,
    /// 250
    DriverArrived,
    /// 300: the rider is in the vehicle.
    PickedUp,
    /// 400
    DroppedOff,
    /// 500
    Complete,
    /// 505: the rider did not show up at pickup.
    NoShow,
    /// 509: the trip ended without reaching the destination.
    Incomplete,
    /// Any code without a meaning in this space.
    Ignored(i32),
}

impl RideProgressStatus {
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::RequestInProgress,
            100 => Self::Scheduled,
            200 => Self::DriverEnRoute,
            250 => Self::DriverArrived,
            300 => Self::PickedUp,
            400 => Self::DroppedOff,
            500 => Self::Complete,
            505 => Self::NoShow,
            509 => Self::Incomplete,
            other => Self::Ignored(other),
        }
    }

    pub const fn code(&self) -> i32 {
        match self {
            Self::RequestInProgress => 0,
            Self::Scheduled => 100,
            Self::DriverEnRoute => 200,
            Self::DriverArrived => 250,
            Self::PickedUp => 300,
            Self::DroppedOff => 400,
            Self::Complete => 500,
            Self::NoShow => 505,
            Self::Incomplete => 509,
            Self::Ignored(code) => *code,
        }
    }

    /// Whether the rider has not been picked up yet.
    ///
    /// Unknown codes are treated as "not yet picked up" only when they sort
    /// below the pickup code, following the numeric ordering convention.
    pub const fn is_before_pickup(&self) -> bool {
        self.code() < Self::PickedUp.code()
    }
}

impl From<i32> for RideProgressStatus {
    fn from(code: i32) -> Self {
        Self::from_code(code)
    }
}

impl From<RideProgressStatus> for i32 {
    fn from(status: RideProgressStatus) -> Self {
        status.code()
    }
}

/// Administrative approval stage of a ride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum RideWorkflowStatus {
    /// 100
    Submitted,
    /// 200
    PendingReview,
    /// 300
    Approved,
    /// 400
    Denied,
    /// 500
    DriverAssigned,
    /// 600
    OnHold,
    /// 900: an emergency was raised during the ride.
    Emergency,
    /// 1000
    CancelledByRider,
    /// 1100
    CancelledByAdmin,
    /// Any code without a meaning in this space.
    Ignored(i32),
}

impl RideWorkflowStatus {
    pub const fn from_code(code: i32) -> Self {
        match code {
            100 => Self::Submitted,
            200 => Self::PendingReview,
            300 => Self::Approved,
            400 => Self::Denied,
            500 => Self::DriverAssigned,
            600 => Self::OnHold,
            900 => Self::Emergency,
            1000 => Self::CancelledByRider,
            1100 => Self::CancelledByAdmin,
            other => Self::Ignored(other),
        }
    }

    pub const fn code(&self) -> i32 {
        match self {
            Self::Submitted => 100,
            Self::PendingReview => 200,
            Self::Approved => 300,
            Self::Denied => 400,
            Self::DriverAssigned => 500,
            Self::OnHold => 600,
            Self::Emergency => 900,
            Self::CancelledByRider => 1000,
            Self::CancelledByAdmin => 1100,
            Self::Ignored(code) => *code,
        }
    }

    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::CancelledByRider | Self::CancelledByAdmin)
    }
}

impl From<i32> for RideWorkflowStatus {
    fn from(code: i32) -> Self {
        Self::from_code(code)
    }
}

impl From<RideWorkflowStatus> for i32 {
    fn from(status: RideWorkflowStatus) -> Self {
        status.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_codes_round_trip() {
        for code in [0, 100, 200, 250, 300, 400, 500, 505, 509] {
            let status = RideProgressStatus::from_code(code);
            assert!(!matches!(status, RideProgressStatus::Ignored(_)));
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn test_unknown_codes_are_ignored() {
        assert_eq!(
            RideProgressStatus::from_code(301),
            RideProgressStatus::Ignored(301)
        );
        assert_eq!(
            RideWorkflowStatus::from_code(-1),
            RideWorkflowStatus::Ignored(-1)
        );
        // Spaces are disjoint: a workflow-only code means nothing as progress.
        assert_eq!(
            RideProgressStatus::from_code(1000),
            RideProgressStatus::Ignored(1000)
        );
    }

    #[test]
    fn test_before_pickup() {
        assert!(RideProgressStatus::DriverArrived.is_before_pickup());
        assert!(!RideProgressStatus::PickedUp.is_before_pickup());
        assert!(!RideProgressStatus::Complete.is_before_pickup());
    }

    #[test]
    fn test_workflow_cancelled() {
        assert!(RideWorkflowStatus::CancelledByAdmin.is_cancelled());
        assert!(!RideWorkflowStatus::Approved.is_cancelled());
    }

    #[test]
    fn test_serializes_as_code() {
        let json = serde_json::to_string(&RideProgressStatus::PickedUp).unwrap();
        assert_eq!(json, "300");
        let parsed: RideWorkflowStatus = serde_json::from_str("900").unwrap();
        assert_eq!(parsed, RideWorkflowStatus::Emergency);
    }
}
