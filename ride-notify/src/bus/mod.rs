//! In-process domain event bus.
//!
//! Handlers subscribe per [`DomainEventKind`]. Publishing runs every handler
//! registered for the event's kind, one after another in subscription
//! order. A handler that errors or panics is logged and counted; the others
//! still run and the publisher never sees the failure.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::Result;
use crate::domain::{DomainEvent, DomainEventKind};

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

/// Outcome of one publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub handled: usize,
    pub failed: usize,
}

impl PublishReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Default)]
pub struct EventBus {
    handlers: DashMap<DomainEventKind, Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: DomainEventKind, handler: Arc<dyn EventHandler>) {
        debug!(kind = %kind, handler = handler.name(), "Handler subscribed");
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn subscribe_many(&self, kinds: &[DomainEventKind], handler: Arc<dyn EventHandler>) {
        for kind in kinds {
            self.subscribe(*kind, Arc::clone(&handler));
        }
    }

    pub fn handler_count(&self, kind: DomainEventKind) -> usize {
        self.handlers.get(&kind).map_or(0, |h| h.len())
    }

    pub async fn publish(&self, event: &DomainEvent) -> PublishReport {
        // Snapshot so no map guard is held across an await.
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .get(&event.kind)
            .map(|h| h.clone())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(kind = %event.kind, ride_id = %event.ride_id, "No handlers for event");
            return PublishReport::default();
        }

        let mut report = PublishReport::default();
        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle(event)).catch_unwind().await;
            match outcome {
                Ok(Ok(())) => report.handled += 1,
                Ok(Err(e)) => {
                    warn!(
                        handler = handler.name(),
                        kind = %event.kind,
                        ride_id = %event.ride_id,
                        error = %e,
                        "Event handler failed"
                    );
                    report.failed += 1;
                }
                Err(panic) => {
                    error!(
                        handler = handler.name(),
                        kind = %event.kind,
                        ride_id = %event.ride_id,
                        panic = %panic_message(panic.as_ref()),
                        "Event handler panicked"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    crate::panic_hook::payload_to_string(payload)
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use parking_lot::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(&self, event: &DomainEvent) -> Result<()> {
            self.seen.lock().push(format!("{}:{}", self.name, event.kind));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn handle(&self, _event: &DomainEvent) -> Result<()> {
            Err(Error::handler("nope"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn handle(&self, _event: &DomainEvent) -> Result<()> {
            panic!("handler blew up");
        }
    }

    fn event(kind: DomainEventKind) -> DomainEvent {
        DomainEvent::new(kind, "ride-1", "rider-1")
    }

    #[tokio::test]
    async fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            bus.subscribe(
                DomainEventKind::DriverArrived,
                Arc::new(Recorder {
                    name,
                    seen: seen.clone(),
                }),
            );
        }

        let report = bus.publish(&event(DomainEventKind::DriverArrived)).await;
        assert_eq!(report.handled, 2);
        assert_eq!(
            *seen.lock(),
            vec!["first:driver_arrived", "second:driver_arrived"]
        );
    }

    #[tokio::test]
    async fn test_only_matching_kind_is_dispatched() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            DomainEventKind::RideCompleted,
            Arc::new(Recorder {
                name: "r",
                seen: seen.clone(),
            }),
        );

        let report = bus.publish(&event(DomainEventKind::RideDenied)).await;
        assert_eq!(report, PublishReport::default());
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(DomainEventKind::EmergencyAlert, Arc::new(Panicking));
        bus.subscribe(DomainEventKind::EmergencyAlert, Arc::new(Failing));
        bus.subscribe(
            DomainEventKind::EmergencyAlert,
            Arc::new(Recorder {
                name: "after",
                seen: seen.clone(),
            }),
        );

        let report = bus.publish(&event(DomainEventKind::EmergencyAlert)).await;
        assert_eq!(report.handled, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_many() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_many(
            &[DomainEventKind::RideApproved, DomainEventKind::RideDenied],
            Arc::new(Recorder { name: "r", seen }),
        );
        assert_eq!(bus.handler_count(DomainEventKind::RideApproved), 1);
        assert_eq!(bus.handler_count(DomainEventKind::RideDenied), 1);
        assert_eq!(bus.handler_count(DomainEventKind::RideCompleted), 0);
    }
}
