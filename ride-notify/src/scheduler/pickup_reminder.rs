//! Pickup reminder scan.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::PeriodicTask;
use crate::Result;
use crate::bus::EventBus;
use crate::change_feed::RideDocumentStore;
use crate::domain::DomainEventKind;
use crate::domain::events::attr;
use crate::translator::ride_event;

#[derive(Debug, Clone)]
pub struct PickupReminderConfig {
    pub interval: Duration,
    /// How long before pickup the reminder goes out.
    pub lead: Duration,
}

impl Default for PickupReminderConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            lead: Duration::from_secs(30 * 60),
        }
    }
}

/// Publishes a [`DomainEventKind::PickupReminder`] for every ride whose
/// pickup is coming up and that is still awaiting pickup.
///
/// The scan window reaches two intervals past the lead so a reminder is
/// queued ahead of time and released by its `notify_at` instant.
pub struct PickupReminderTask {
    rides: Arc<dyn RideDocumentStore>,
    bus: Arc<EventBus>,
    config: PickupReminderConfig,
    /// Ride id to the pickup time it was reminded for.
    reminded: DashMap<String, DateTime<Utc>>,
}

impl PickupReminderTask {
    pub fn new(
        rides: Arc<dyn RideDocumentStore>,
        bus: Arc<EventBus>,
        config: PickupReminderConfig,
    ) -> Self {
        Self {
            rides,
            bus,
            config,
            reminded: DashMap::new(),
        }
    }

    pub async fn scan(&self, now: DateTime<Utc>) -> Result<usize> {
        let lead = TimeDelta::from_std(self.config.lead).unwrap_or(TimeDelta::MAX);
        let horizon = TimeDelta::from_std(self.config.interval * 2).unwrap_or(TimeDelta::zero());
        let until = now
            .checked_add_signed(lead)
            .and_then(|t| t.checked_add_signed(horizon))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        // A rescheduled pickup gets a fresh reminder.
        self.reminded.retain(|_, pickup_at| *pickup_at > now);

        let mut published = 0;
        for ride in self.rides.rides_with_pickup_between(now, until).await? {
            let Some(pickup_at) = ride.pickup_at else {
                continue;
            };
            if pickup_at <= now || !ride.awaiting_pickup() {
                continue;
            }
            if self.reminded.get(&ride.id).is_some_and(|at| *at == pickup_at) {
                continue;
            }

            let notify_at = pickup_at
                .checked_sub_signed(lead)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
                .max(now);
            let event = ride_event(DomainEventKind::PickupReminder, &ride)
                .with_attribute(attr::NOTIFY_AT, notify_at.to_rfc3339())
                .with_attribute(
                    attr::OCCURRENCE,
                    format!("pickup:{}", pickup_at.to_rfc3339()),
                );

            let report = self.bus.publish(&event).await;
            if report.all_succeeded() {
                self.reminded.insert(ride.id.clone(), pickup_at);
            }
            debug!(ride_id = %ride.id, %notify_at, "Pickup reminder published");
            published += 1;
        }
        Ok(published)
    }
}

#[async_trait]
impl PeriodicTask for PickupReminderTask {
    fn name(&self) -> &'static str {
        "pickup_reminder"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> Result<usize> {
        self.scan(Utc::now()).await
    }
}
