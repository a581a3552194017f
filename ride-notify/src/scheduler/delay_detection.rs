//! Late pickup detection scan.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::PeriodicTask;
use crate::Result;
use crate::bus::EventBus;
use crate::change_feed::RideDocumentStore;
use crate::domain::DomainEventKind;
use crate::domain::events::attr;
use crate::translator::ride_event;

#[derive(Debug, Clone)]
pub struct DelayDetectionConfig {
    pub interval: Duration,
    /// How far past pickup a ride counts as delayed.
    pub threshold: Duration,
    /// Rides whose pickup is older than this are no longer considered.
    pub lookback: Duration,
}

impl Default for DelayDetectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            threshold: Duration::from_secs(10 * 60),
            lookback: Duration::from_secs(2 * 60 * 60),
        }
    }
}

/// Publishes [`DomainEventKind::RideDelayed`] once per ride whose pickup
/// time has passed by more than the threshold without a pickup.
pub struct DelayDetectionTask {
    rides: Arc<dyn RideDocumentStore>,
    bus: Arc<EventBus>,
    config: DelayDetectionConfig,
    flagged: DashMap<String, DateTime<Utc>>,
}

impl DelayDetectionTask {
    pub fn new(
        rides: Arc<dyn RideDocumentStore>,
        bus: Arc<EventBus>,
        config: DelayDetectionConfig,
    ) -> Self {
        Self {
            rides,
            bus,
            config,
            flagged: DashMap::new(),
        }
    }

    pub async fn scan(&self, now: DateTime<Utc>) -> Result<usize> {
        let threshold = TimeDelta::from_std(self.config.threshold).unwrap_or(TimeDelta::MAX);
        let lookback = TimeDelta::from_std(self.config.lookback).unwrap_or(TimeDelta::MAX);
        let from = now
            .checked_sub_signed(lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let until = now
            .checked_sub_signed(threshold)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if until <= from {
            return Ok(0);
        }

        self.flagged.retain(|_, pickup_at| *pickup_at >= from);

        let mut published = 0;
        for ride in self.rides.rides_with_pickup_between(from, until).await? {
            let Some(pickup_at) = ride.pickup_at else {
                continue;
            };
            if pickup_at >= until || !ride.awaiting_pickup() {
                continue;
            }
            if self.flagged.get(&ride.id).is_some_and(|at| *at == pickup_at) {
                continue;
            }

            let minutes_late = (now - pickup_at).num_minutes();
            let event = ride_event(DomainEventKind::RideDelayed, &ride)
                .with_attribute(attr::MINUTES_LATE, minutes_late.to_string())
                .with_attribute(
                    attr::OCCURRENCE,
                    format!("pickup:{}", pickup_at.to_rfc3339()),
                );

            let report = self.bus.publish(&event).await;
            if report.all_succeeded() {
                self.flagged.insert(ride.id.clone(), pickup_at);
            }
            info!(ride_id = %ride.id, minutes_late, "Ride pickup is late");
            published += 1;
        }

        if published > 0 {
            debug!(published, "Delay scan finished");
        }
        Ok(published)
    }
}

#[async_trait]
impl PeriodicTask for DelayDetectionTask {
    fn name(&self) -> &'static str {
        "delay_detection"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> Result<usize> {
        self.scan(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_pool;
    use crate::database::models::RideDbModel;
    use crate::database::repositories::{RideRepository, SqlxRideRepository};
    use crate::domain::RideDocument;
    use ride_status::{RideProgressStatus, StatusSpace};

    #[tokio::test]
    async fn test_flags_late_rides_once() {
        let repo = Arc::new(SqlxRideRepository::new(init_memory_pool().await.unwrap()));
        let now = Utc::now();

        for (id, minutes_ago) in [("late", 25), ("on_time", 5), ("ancient", 600)] {
            let mut ride = RideDocument::new(id, "rider-1");
            ride.pickup_at = Some(now - TimeDelta::minutes(minutes_ago));
            repo.insert_ride(&RideDbModel::from(&ride)).await.unwrap();
        }
        let mut picked = RideDocument::new("picked", "rider-2");
        picked.pickup_at = Some(now - TimeDelta::minutes(30));
        picked.progress_status = RideProgressStatus::PickedUp;
        repo.insert_ride(&RideDbModel::from(&picked)).await.unwrap();

        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        struct Capture(Arc<parking_lot::Mutex<Vec<crate::domain::DomainEvent>>>);
        #[async_trait]
        impl crate::bus::EventHandler for Capture {
            fn name(&self) -> &'static str {
                "capture"
            }
            async fn handle(&self, event: &crate::domain::DomainEvent) -> Result<()> {
                self.0.lock().push(event.clone());
                Ok(())
            }
        }
        bus.subscribe(DomainEventKind::RideDelayed, Arc::new(Capture(seen.clone())));

        let task = DelayDetectionTask::new(repo.clone(), bus, DelayDetectionConfig::default());
        assert_eq!(task.scan(now).await.unwrap(), 1);
        assert_eq!(task.scan(now).await.unwrap(), 0);

        let events = seen.lock();
        assert_eq!(events[0].ride_id, "late");
        assert_eq!(events[0].attribute(attr::MINUTES_LATE), Some("25"));
        let pickup = events[0].attribute(attr::PICKUP_AT).unwrap();
        assert_eq!(events[0].occurrence(), format!("pickup:{pickup}"));

        // Picking the rider up afterwards changes nothing already sent.
        drop(events);
        repo.set_status("late", StatusSpace::Progress, 300, None)
            .await
            .unwrap();
        assert_eq!(task.scan(now).await.unwrap(), 0);
    }
}
