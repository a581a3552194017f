//! Bus handler that turns ride events into queued notifications.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::templates::MessageTemplates;
use crate::bus::{EventBus, EventHandler};
use crate::domain::events::attr;
use crate::domain::{
    DomainEvent, DomainEventKind, NewNotification, NotificationChannel, NotificationPriority,
};
use crate::queue::NotificationQueue;
use crate::{Error, Result};

/// Who hears about an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Rider,
    /// The emergency contact first, then the rider.
    EmergencyContactAndRider,
}

/// How one event kind becomes notifications.
#[derive(Debug, Clone)]
pub struct NotificationRule {
    pub kind: DomainEventKind,
    pub priority: NotificationPriority,
    pub audience: Audience,
    /// Cancel everything still outstanding for the ride before enqueueing.
    pub cancels_outstanding: bool,
    /// Cancel outstanding items of the same kind left by an earlier
    /// occurrence, such as a reminder for a pickup time that moved.
    pub supersedes_previous: bool,
}

impl NotificationRule {
    const fn rider(kind: DomainEventKind, priority: NotificationPriority) -> Self {
        Self {
            kind,
            priority,
            audience: Audience::Rider,
            cancels_outstanding: false,
            supersedes_previous: false,
        }
    }
}

pub fn default_rules() -> Vec<NotificationRule> {
    use DomainEventKind::*;
    use NotificationPriority::*;
    vec![
        NotificationRule::rider(RideRequested, Low),
        NotificationRule::rider(RideApproved, Medium),
        NotificationRule::rider(RideDenied, Medium),
        NotificationRule {
            cancels_outstanding: true,
            ..NotificationRule::rider(RideCancelled, High)
        },
        NotificationRule::rider(DriverAssigned, Medium),
        NotificationRule::rider(DriverEnRoute, Medium),
        NotificationRule::rider(DriverArrived, High),
        NotificationRule::rider(RiderPickedUp, Medium),
        NotificationRule::rider(RiderDroppedOff, Low),
        NotificationRule::rider(RideCompleted, Low),
        NotificationRule::rider(RideIncomplete, Medium),
        NotificationRule::rider(RiderNoShow, Medium),
        NotificationRule::rider(RideDelayed, High),
        NotificationRule {
            supersedes_previous: true,
            ..NotificationRule::rider(PickupReminder, Medium)
        },
        NotificationRule {
            audience: Audience::EmergencyContactAndRider,
            ..NotificationRule::rider(EmergencyAlert, Urgent)
        },
    ]
}

/// Dedupe key: at most one notification per source occurrence and
/// recipient. A replayed change maps to the same key; a new mutation of the
/// same ride does not.
pub fn dedupe_key(event: &DomainEvent, recipient: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        event.ride_id,
        event.kind,
        event.occurrence(),
        recipient
    )
}

pub struct RideNotificationHandler {
    queue: Arc<NotificationQueue>,
    templates: MessageTemplates,
    rules: HashMap<DomainEventKind, NotificationRule>,
    channel: NotificationChannel,
}

impl RideNotificationHandler {
    pub fn new(queue: Arc<NotificationQueue>, templates: MessageTemplates) -> Self {
        Self::with_rules(queue, templates, default_rules())
    }

    pub fn with_rules(
        queue: Arc<NotificationQueue>,
        templates: MessageTemplates,
        rules: Vec<NotificationRule>,
    ) -> Self {
        Self {
            queue,
            templates,
            rules: rules.into_iter().map(|r| (r.kind, r)).collect(),
            channel: NotificationChannel::Sms,
        }
    }

    pub fn kinds(&self) -> Vec<DomainEventKind> {
        DomainEventKind::ALL
            .into_iter()
            .filter(|k| self.rules.contains_key(k))
            .collect()
    }

    /// Subscribe to every kind this handler has a rule for.
    pub fn register(self: Arc<Self>, bus: &EventBus) {
        let kinds = self.kinds();
        bus.subscribe_many(&kinds, self);
    }

    fn recipients<'a>(audience: Audience, event: &'a DomainEvent) -> Vec<&'a str> {
        match audience {
            Audience::Rider => vec![event.subject_id.as_str()],
            Audience::EmergencyContactAndRider => event
                .attribute(attr::EMERGENCY_CONTACT_ID)
                .into_iter()
                .chain(std::iter::once(event.subject_id.as_str()))
                .collect(),
        }
    }

    fn scheduled_time(event: &DomainEvent) -> Option<DateTime<Utc>> {
        event
            .attribute(attr::NOTIFY_AT)
            .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
            .map(|at| at.with_timezone(&Utc))
    }
}

#[async_trait]
impl EventHandler for RideNotificationHandler {
    fn name(&self) -> &'static str {
        "ride_notification"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        let Some(rule) = self.rules.get(&event.kind) else {
            debug!(kind = %event.kind, "No notification rule");
            return Ok(());
        };

        if rule.cancels_outstanding {
            let cancelled = self
                .queue
                .cancel_by_correlation(event.correlation_id())
                .await?;
            info!(ride_id = %event.ride_id, cancelled, "Outstanding notifications cancelled for ride");
        } else if rule.supersedes_previous {
            self.queue
                .cancel_superseded(
                    event.correlation_id(),
                    &event.kind.to_string(),
                    event.occurrence(),
                )
                .await?;
        }

        let body = self
            .templates
            .render_event(event)
            .ok_or_else(|| Error::handler(format!("no template for {}", event.kind)))?;
        let scheduled = Self::scheduled_time(event);

        for recipient in Self::recipients(rule.audience, event) {
            let mut new = NewNotification::new(self.channel, recipient, body.clone())
                .with_priority(rule.priority)
                .with_correlation_id(event.correlation_id())
                .with_kind(event.kind.to_string())
                .with_dedupe_key(dedupe_key(event, recipient))
                .with_occurrence(event.occurrence())
                .with_extra("event_id", serde_json::Value::String(event.id.clone()));
            if let Some(at) = scheduled {
                new = new.scheduled_at(at);
            }
            self.queue.enqueue(new).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;
    use crate::database::repositories::SqlxNotificationRepository;
    use crate::domain::NotificationStatus;
    use crate::queue::QueueConfig;

    async fn setup() -> (Arc<NotificationQueue>, EventBus) {
        let pool = init_memory_pool().await.unwrap();
        let queue = Arc::new(NotificationQueue::new(
            Arc::new(SqlxNotificationRepository::new(pool)),
            QueueConfig::default(),
        ));
        let bus = EventBus::new();
        Arc::new(RideNotificationHandler::new(
            queue.clone(),
            MessageTemplates::default(),
        ))
        .register(&bus);
        (queue, bus)
    }

    #[test]
    fn test_every_kind_has_a_rule() {
        let rules = default_rules();
        for kind in DomainEventKind::ALL {
            assert!(rules.iter().any(|r| r.kind == kind), "no rule for {kind}");
        }
    }

    #[tokio::test]
    async fn test_event_becomes_one_notification() {
        let (queue, bus) = setup().await;
        let event = DomainEvent::new(DomainEventKind::DriverArrived, "ride-1", "+15550001");

        let report = bus.publish(&event).await;
        assert_eq!(report.handled, 1);

        let items = queue.history("ride-1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].recipient, "+15550001");
        assert_eq!(items[0].priority, NotificationPriority::High);
        assert_eq!(items[0].metadata.kind.as_deref(), Some("driver_arrived"));
    }

    #[tokio::test]
    async fn test_replayed_occurrence_is_deduplicated() {
        let (queue, bus) = setup().await;
        for _ in 0..3 {
            let event = DomainEvent::new(DomainEventKind::DriverEnRoute, "ride-1", "+1")
                .with_attribute(attr::OCCURRENCE, "progress_status:17");
            bus.publish(&event).await;
        }
        let items = queue.history("ride-1").await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].occurrence(), Some("progress_status:17"));
    }

    #[tokio::test]
    async fn test_driver_reassignment_notifies_again() {
        let (queue, bus) = setup().await;
        for (token, driver) in [("assignment:3", "driver-A"), ("assignment:8", "driver-B")] {
            let event = DomainEvent::new(DomainEventKind::DriverAssigned, "ride-1", "+1")
                .with_attribute(attr::DRIVER_ID, driver)
                .with_attribute(attr::OCCURRENCE, token);
            bus.publish(&event).await;
        }

        let items = queue.history("ride-1").await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].message_body.contains("driver-A"));
        assert!(items[1].message_body.contains("driver-B"));
        assert!(
            items
                .iter()
                .all(|i| i.status == NotificationStatus::Pending)
        );
    }

    #[tokio::test]
    async fn test_second_emergency_is_not_swallowed() {
        let (queue, bus) = setup().await;
        for token in ["progress_status:4", "progress_status:9"] {
            let event = DomainEvent::new(DomainEventKind::EmergencyAlert, "ride-1", "+1rider")
                .with_attribute(attr::EMERGENCY_CONTACT_ID, "+1contact")
                .with_attribute(attr::OCCURRENCE, token);
            bus.publish(&event).await;
        }

        let items = queue.history("ride-1").await.unwrap();
        assert_eq!(items.len(), 4);
        assert!(
            items
                .iter()
                .all(|i| i.priority == NotificationPriority::Urgent)
        );
    }

    #[tokio::test]
    async fn test_rescheduled_pickup_replaces_reminder() {
        let (queue, bus) = setup().await;
        let first = Utc::now() + chrono::TimeDelta::minutes(10);
        let moved = Utc::now() + chrono::TimeDelta::minutes(40);
        for at in [first, moved] {
            let event = DomainEvent::new(DomainEventKind::PickupReminder, "ride-1", "+1")
                .with_attribute(attr::NOTIFY_AT, at.to_rfc3339())
                .with_attribute(attr::OCCURRENCE, format!("pickup:{}", at.to_rfc3339()));
            bus.publish(&event).await;
        }

        let items = queue.history("ride-1").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].status, NotificationStatus::Cancelled);
        assert_eq!(items[1].status, NotificationStatus::Pending);
        let scheduled = items[1].scheduled_time.unwrap();
        assert!((scheduled - moved).num_milliseconds().abs() < 1_000);

        // Replaying the live reminder keeps it.
        let replay = DomainEvent::new(DomainEventKind::PickupReminder, "ride-1", "+1")
            .with_attribute(attr::NOTIFY_AT, moved.to_rfc3339())
            .with_attribute(attr::OCCURRENCE, format!("pickup:{}", moved.to_rfc3339()));
        bus.publish(&replay).await;
        let items = queue.history("ride-1").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].status, NotificationStatus::Pending);
    }

    #[tokio::test]
    async fn test_emergency_notifies_contact_and_rider_urgently() {
        let (queue, bus) = setup().await;
        let event = DomainEvent::new(DomainEventKind::EmergencyAlert, "ride-1", "+1rider")
            .with_attribute(attr::EMERGENCY_CONTACT_ID, "+1contact");
        bus.publish(&event).await;

        let items = queue.history("ride-1").await.unwrap();
        let recipients: Vec<&str> = items.iter().map(|i| i.recipient.as_str()).collect();
        assert_eq!(recipients, vec!["+1contact", "+1rider"]);
        assert!(
            items
                .iter()
                .all(|i| i.priority == NotificationPriority::Urgent)
        );
    }

    #[tokio::test]
    async fn test_cancellation_clears_outstanding_then_notifies() {
        let (queue, bus) = setup().await;
        bus.publish(&DomainEvent::new(
            DomainEventKind::RideApproved,
            "ride-1",
            "+1",
        ))
        .await;
        bus.publish(&DomainEvent::new(
            DomainEventKind::RideCancelled,
            "ride-1",
            "+1",
        ))
        .await;

        let items = queue.history("ride-1").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].status, NotificationStatus::Cancelled);
        assert_eq!(items[1].status, NotificationStatus::Pending);
        assert_eq!(items[1].metadata.kind.as_deref(), Some("ride_cancelled"));
    }

    #[tokio::test]
    async fn test_notify_at_schedules_item() {
        let (queue, bus) = setup().await;
        let at = Utc::now() + chrono::TimeDelta::minutes(10);
        let event = DomainEvent::new(DomainEventKind::PickupReminder, "ride-1", "+1")
            .with_attribute(attr::NOTIFY_AT, at.to_rfc3339());
        bus.publish(&event).await;

        let item = &queue.history("ride-1").await.unwrap()[0];
        let scheduled = item.scheduled_time.unwrap();
        assert!((scheduled - at).num_milliseconds().abs() < 1_000);
        assert!(queue.list_eligible(10).await.unwrap().is_empty());
    }
}
