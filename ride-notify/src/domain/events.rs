//! Domain events emitted by the status translator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

/// Closed set of things that can happen to a ride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DomainEventKind {
    RideRequested,
    RideApproved,
    RideDenied,
    RideCancelled,
    DriverAssigned,
    DriverEnRoute,
    DriverArrived,
    RiderPickedUp,
    RiderDroppedOff,
    RideCompleted,
    RideIncomplete,
    RiderNoShow,
    RideDelayed,
    PickupReminder,
    EmergencyAlert,
}

impl DomainEventKind {
    pub const ALL: [Self; 15] = [
        Self::RideRequested,
        Self::RideApproved,
        Self::RideDenied,
        Self::RideCancelled,
        Self::DriverAssigned,
        Self::DriverEnRoute,
        Self::DriverArrived,
        Self::RiderPickedUp,
        Self::RiderDroppedOff,
        Self::RideCompleted,
        Self::RideIncomplete,
        Self::RiderNoShow,
        Self::RideDelayed,
        Self::PickupReminder,
        Self::EmergencyAlert,
    ];
}

/// Well-known attribute keys.
pub mod attr {
    pub const STATUS_SPACE: &str = "status_space";
    pub const OLD_STATUS: &str = "old_status";
    pub const NEW_STATUS: &str = "new_status";
    pub const DRIVER_ID: &str = "driver_id";
    pub const EMERGENCY_CONTACT_ID: &str = "emergency_contact_id";
    pub const PICKUP_ADDRESS: &str = "pickup_address";
    pub const PICKUP_AT: &str = "pickup_at";
    /// RFC 3339 instant before which the notification must not go out.
    pub const NOTIFY_AT: &str = "notify_at";
    pub const MINUTES_LATE: &str = "minutes_late";
    /// Identity of the source occurrence. Replays of the same mutation or
    /// scan hit carry the same value.
    pub const OCCURRENCE: &str = "occurrence";
}

/// Something that happened to a ride, ready for the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: String,
    pub kind: DomainEventKind,
    pub ride_id: String,
    /// Primary person the event is about, normally the rider.
    pub subject_id: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl DomainEvent {
    pub fn new(
        kind: DomainEventKind,
        ride_id: impl Into<String>,
        subject_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            ride_id: ride_id.into(),
            subject_id: subject_id.into(),
            occurred_at: Utc::now(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Insert the attribute only when a value is present.
    pub fn with_optional_attribute(self, key: &str, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(v) => self.with_attribute(key, v),
            None => self,
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Source occurrence of the event, or its own id when the producer did
    /// not set one.
    pub fn occurrence(&self) -> &str {
        self.attribute(attr::OCCURRENCE).unwrap_or(&self.id)
    }

    /// Correlation id shared by every notification for the same ride.
    pub fn correlation_id(&self) -> &str {
        &self.ride_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(DomainEventKind::RiderPickedUp.to_string(), "rider_picked_up");
        assert_eq!(
            "emergency_alert".parse::<DomainEventKind>().unwrap(),
            DomainEventKind::EmergencyAlert
        );
        assert_eq!(DomainEventKind::ALL.len(), 15);
    }

    #[test]
    fn test_optional_attribute() {
        let event = DomainEvent::new(DomainEventKind::DriverAssigned, "ride-1", "rider-1")
            .with_optional_attribute(attr::DRIVER_ID, Some("driver-9"))
            .with_optional_attribute(attr::PICKUP_ADDRESS, None::<String>);
        assert_eq!(event.attribute(attr::DRIVER_ID), Some("driver-9"));
        assert_eq!(event.attribute(attr::PICKUP_ADDRESS), None);
        assert_eq!(event.correlation_id(), "ride-1");
    }

    #[test]
    fn test_occurrence_falls_back_to_event_id() {
        let event = DomainEvent::new(DomainEventKind::DriverAssigned, "ride-1", "rider-1");
        assert_eq!(event.occurrence(), event.id);

        let event = event.with_attribute(attr::OCCURRENCE, "assignment:42");
        assert_eq!(event.occurrence(), "assignment:42");
    }
}
