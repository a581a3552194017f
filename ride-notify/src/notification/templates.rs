//! Message templates.
//!
//! Templates use `{name}` placeholders. Unknown placeholders are left in
//! place so a typo shows up in the delivered text instead of vanishing.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::domain::events::attr;
use crate::domain::{DomainEvent, DomainEventKind};

/// Substitute `{name}` placeholders from `vars`.
pub fn render(template: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Placeholder values derived from an event.
pub fn event_vars(event: &DomainEvent) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    vars.insert("ride_id", event.ride_id.clone());
    vars.insert("rider_id", event.subject_id.clone());
    vars.insert(
        "driver",
        event
            .attribute(attr::DRIVER_ID)
            .unwrap_or("your driver")
            .to_string(),
    );
    vars.insert(
        "pickup_address",
        event
            .attribute(attr::PICKUP_ADDRESS)
            .unwrap_or("your pickup location")
            .to_string(),
    );
    let pickup_time = event
        .attribute(attr::PICKUP_AT)
        .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
        .map(|at| at.with_timezone(&Utc).format("%H:%M UTC").to_string())
        .unwrap_or_else(|| "the scheduled time".to_string());
    vars.insert("pickup_time", pickup_time);
    if let Some(minutes) = event.attribute(attr::MINUTES_LATE) {
        vars.insert("minutes_late", minutes.to_string());
    }
    vars
}

/// Message text per event kind.
#[derive(Debug, Clone)]
pub struct MessageTemplates {
    templates: HashMap<DomainEventKind, String>,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        use DomainEventKind::*;
        let defaults = [
            (RideRequested, "We received your ride request {ride_id}. We'll text you once it is reviewed."),
            (RideApproved, "Your ride {ride_id} is approved for pickup at {pickup_time}."),
            (RideDenied, "Sorry, your ride request {ride_id} could not be approved."),
            (RideCancelled, "Your ride {ride_id} has been cancelled."),
            (DriverAssigned, "Driver {driver} has been assigned to your ride {ride_id}."),
            (DriverEnRoute, "{driver} is on the way to {pickup_address}."),
            (DriverArrived, "{driver} has arrived at {pickup_address}."),
            (RiderPickedUp, "You're on your way. Have a safe ride!"),
            (RiderDroppedOff, "You've arrived. Thanks for riding with us."),
            (RideCompleted, "Your ride {ride_id} is complete."),
            (RideIncomplete, "Your ride {ride_id} ended early. Contact us if you need help."),
            (RiderNoShow, "We missed you at {pickup_address}. Your ride {ride_id} was marked as a no-show."),
            (RideDelayed, "Your pickup is running about {minutes_late} minutes late. We're sorry for the wait."),
            (PickupReminder, "Reminder: your ride is picking you up at {pickup_time} from {pickup_address}."),
            (EmergencyAlert, "EMERGENCY: an alert was raised on ride {ride_id} for rider {rider_id}."),
        ];
        Self {
            templates: defaults
                .into_iter()
                .map(|(kind, text)| (kind, text.to_string()))
                .collect(),
        }
    }
}

impl MessageTemplates {
    pub fn with_template(mut self, kind: DomainEventKind, template: impl Into<String>) -> Self {
        self.templates.insert(kind, template.into());
        self
    }

    pub fn get(&self, kind: DomainEventKind) -> Option<&str> {
        self.templates.get(&kind).map(String::as_str)
    }

    pub fn render_event(&self, event: &DomainEvent) -> Option<String> {
        let template = self.get(event.kind)?;
        Some(render(template, &event_vars(event)))
    }
}
