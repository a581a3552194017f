//! Status change translation.
//!
//! Pure mapping from raw status transitions on a ride to domain events.
//! Only the new code decides the event; the old code is carried along as
//! context. Codes with no meaning, and meaningful codes that deliberately
//! produce nothing, both yield `None`.

use ride_status::{RideProgressStatus, RideWorkflowStatus, StatusSpace};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::events::attr;
use crate::domain::{DomainEvent, DomainEventKind, RideDocument};

/// A status field changed from `old` to `new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub space: StatusSpace,
    pub old: Option<i32>,
    pub new: i32,
}

impl StatusChange {
    pub fn new(space: StatusSpace, old: Option<i32>, new: i32) -> Self {
        Self { space, old, new }
    }

    pub fn is_noop(&self) -> bool {
        self.old == Some(self.new)
    }
}

pub fn progress_event(status: RideProgressStatus) -> Option<DomainEventKind> {
    match status {
        RideProgressStatus::RequestInProgress | RideProgressStatus::Scheduled => None,
        RideProgressStatus::DriverEnRoute => Some(DomainEventKind::DriverEnRoute),
        RideProgressStatus::DriverArrived => Some(DomainEventKind::DriverArrived),
        RideProgressStatus::PickedUp => Some(DomainEventKind::RiderPickedUp),
        RideProgressStatus::DroppedOff => Some(DomainEventKind::RiderDroppedOff),
        RideProgressStatus::Complete => Some(DomainEventKind::RideCompleted),
        RideProgressStatus::NoShow => Some(DomainEventKind::RiderNoShow),
        RideProgressStatus::Incomplete => Some(DomainEventKind::RideIncomplete),
        RideProgressStatus::Ignored(_) => None,
    }
}

pub fn workflow_event(status: RideWorkflowStatus) -> Option<DomainEventKind> {
    match status {
        RideWorkflowStatus::Submitted => Some(DomainEventKind::RideRequested),
        RideWorkflowStatus::PendingReview | RideWorkflowStatus::OnHold => None,
        RideWorkflowStatus::Approved => Some(DomainEventKind::RideApproved),
        RideWorkflowStatus::Denied => Some(DomainEventKind::RideDenied),
        RideWorkflowStatus::DriverAssigned => Some(DomainEventKind::DriverAssigned),
        RideWorkflowStatus::Emergency => Some(DomainEventKind::EmergencyAlert),
        RideWorkflowStatus::CancelledByRider | RideWorkflowStatus::CancelledByAdmin => {
            Some(DomainEventKind::RideCancelled)
        }
        RideWorkflowStatus::Ignored(_) => None,
    }
}

/// Map a status transition to a domain event about `ride`.
pub fn translate(change: &StatusChange, ride: &RideDocument) -> Option<DomainEvent> {
    if change.is_noop() {
        debug!(ride_id = %ride.id, space = %change.space, code = change.new, "Status unchanged");
        return None;
    }

    let kind = match change.space {
        StatusSpace::Progress => progress_event(RideProgressStatus::from_code(change.new)),
        StatusSpace::Workflow => workflow_event(RideWorkflowStatus::from_code(change.new)),
    };

    let Some(kind) = kind else {
        debug!(
            ride_id = %ride.id,
            space = %change.space,
            old = ?change.old,
            new = change.new,
            "Status change has no notification"
        );
        return None;
    };

    let event = ride_event(kind, ride)
        .with_attribute(attr::STATUS_SPACE, change.space.as_str())
        .with_attribute(attr::NEW_STATUS, change.new.to_string())
        .with_optional_attribute(attr::OLD_STATUS, change.old.map(|c| c.to_string()));
    Some(event)
}

/// A newly inserted ride is a request.
pub fn translate_insert(ride: &RideDocument) -> Option<DomainEvent> {
    if ride.workflow_status.is_cancelled() {
        return None;
    }
    Some(ride_event(DomainEventKind::RideRequested, ride))
}

/// A driver was set or replaced on the ride.
pub fn translate_assignment(old_driver: Option<&str>, ride: &RideDocument) -> Option<DomainEvent> {
    let new_driver = ride.driver_id.as_deref()?;
    if old_driver == Some(new_driver) {
        return None;
    }
    Some(ride_event(DomainEventKind::DriverAssigned, ride))
}

/// Event skeleton carrying the ride context every handler may need.
pub fn ride_event(kind: DomainEventKind, ride: &RideDocument) -> DomainEvent {
    DomainEvent::new(kind, &ride.id, &ride.rider_id)
        .with_optional_attribute(attr::DRIVER_ID, ride.driver_id.clone())
        .with_optional_attribute(attr::EMERGENCY_CONTACT_ID, ride.emergency_contact_id.clone())
        .with_optional_attribute(attr::PICKUP_ADDRESS, ride.pickup_address.clone())
        .with_optional_attribute(attr::PICKUP_AT, ride.pickup_at.map(|at| at.to_rfc3339()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ride() -> RideDocument {
        let mut ride = RideDocument::new("ride-1", "rider-1");
        ride.driver_id = Some("driver-1".to_string());
        ride
    }

    fn kind_for(space: StatusSpace, code: i32) -> Option<DomainEventKind> {
        translate(&StatusChange::new(space, None, code), &ride()).map(|e| e.kind)
    }

    #[test]
    fn test_progress_table() {
        use DomainEventKind::*;
        let expected = [
            (0, None),
            (100, None),
            (200, Some(DriverEnRoute)),
            (250, Some(DriverArrived)),
            (300, Some(RiderPickedUp)),
            (400, Some(RiderDroppedOff)),
            (500, Some(RideCompleted)),
            (505, Some(RiderNoShow)),
            (509, Some(RideIncomplete)),
        ];
        for (code, kind) in expected {
            assert_eq!(kind_for(StatusSpace::Progress, code), kind, "code {code}");
        }
    }

    #[test]
    fn test_workflow_table() {
        use DomainEventKind::*;
        let expected = [
            (100, Some(RideRequested)),
            (200, None),
            (300, Some(RideApproved)),
            (400, Some(RideDenied)),
            (500, Some(DriverAssigned)),
            (600, None),
            (900, Some(EmergencyAlert)),
            (1000, Some(RideCancelled)),
            (1100, Some(RideCancelled)),
        ];
        for (code, kind) in expected {
            assert_eq!(kind_for(StatusSpace::Workflow, code), kind, "code {code}");
        }
    }

    #[test]
    fn test_unknown_codes_produce_nothing() {
        assert_eq!(kind_for(StatusSpace::Progress, 301), None);
        assert_eq!(kind_for(StatusSpace::Progress, 900), None);
        assert_eq!(kind_for(StatusSpace::Workflow, 250), None);
        assert_eq!(kind_for(StatusSpace::Workflow, -5), None);
    }

    #[test]
    fn test_old_value_is_context_only() {
        // Regressions still map by the new code.
        let change = StatusChange::new(StatusSpace::Progress, Some(300), 250);
        let event = translate(&change, &ride()).unwrap();
        assert_eq!(event.kind, DomainEventKind::DriverArrived);
        assert_eq!(event.attribute(attr::OLD_STATUS), Some("300"));
        assert_eq!(event.attribute(attr::NEW_STATUS), Some("250"));
        assert_eq!(event.attribute(attr::STATUS_SPACE), Some("progress"));
        assert_eq!(event.attribute(attr::DRIVER_ID), Some("driver-1"));
    }

    #[test]
    fn test_unchanged_status_is_ignored() {
        let change = StatusChange::new(StatusSpace::Workflow, Some(300), 300);
        assert!(translate(&change, &ride()).is_none());
    }

    #[test]
    fn test_assignment() {
        let ride = ride();
        assert!(translate_assignment(Some("driver-1"), &ride).is_none());
        let event = translate_assignment(None, &ride).unwrap();
        assert_eq!(event.kind, DomainEventKind::DriverAssigned);

        let mut unassigned = ride.clone();
        unassigned.driver_id = None;
        assert!(translate_assignment(Some("driver-1"), &unassigned).is_none());
    }

    #[test]
    fn test_insert() {
        let event = translate_insert(&ride()).unwrap();
        assert_eq!(event.kind, DomainEventKind::RideRequested);
        assert_eq!(event.subject_id, "rider-1");
    }
}
