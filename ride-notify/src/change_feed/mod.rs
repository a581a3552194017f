//! Change feed: watch ride documents and publish domain events.
//!
//! Each [`Subscription`] opens its own stream on the [`ChangeFeed`] with a
//! field filter, resumes from its own checkpoint, and reconnects with
//! exponential backoff when the stream breaks. For every matching change
//! the current ride document is re-read for context, the change is
//! translated, and the resulting event is published on the bus. The
//! checkpoint only advances after that, so delivery to the bus is
//! at-least-once.

mod prune;
mod sqlite;

pub use prune::{ChangeLogPruneConfig, ChangeLogPruner};
pub use sqlite::SqliteChangeFeed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use ride_status::StatusSpace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;
use crate::bus::{EventBus, PublishReport};
use crate::domain::RideDocument;
use crate::domain::events::attr;
use crate::translator::{self, StatusChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
}

/// Opaque position in the change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken(pub String);

impl ResumeToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One mutation of a ride document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub token: ResumeToken,
    pub op: ChangeOp,
    pub document_id: String,
    /// New values of the fields the mutation changed. For inserts, every
    /// tracked field.
    pub changed_fields: BTreeMap<String, serde_json::Value>,
    /// Values of the changed fields before the mutation. Empty for inserts.
    pub previous_values: BTreeMap<String, serde_json::Value>,
    pub occurred_at: DateTime<Utc>,
}

impl RawChange {
    pub fn changed(&self, field: &str) -> bool {
        self.changed_fields.contains_key(field)
    }

    pub fn new_i32(&self, field: &str) -> Option<i32> {
        self.changed_fields.get(field).and_then(json_i32)
    }

    pub fn previous_i32(&self, field: &str) -> Option<i32> {
        self.previous_values.get(field).and_then(json_i32)
    }

    pub fn previous_str(&self, field: &str) -> Option<&str> {
        self.previous_values.get(field).and_then(|v| v.as_str())
    }
}

fn json_i32(value: &serde_json::Value) -> Option<i32> {
    value.as_i64().and_then(|v| i32::try_from(v).ok())
}

/// Which changes a subscription wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub ops: Vec<ChangeOp>,
    /// For updates: at least one of these fields must have changed. Empty
    /// means any field.
    pub fields: Vec<String>,
}

impl ChangeFilter {
    pub fn inserts() -> Self {
        Self {
            ops: vec![ChangeOp::Insert],
            fields: Vec::new(),
        }
    }

    pub fn updates_of(field: &str) -> Self {
        Self {
            ops: vec![ChangeOp::Update],
            fields: vec![field.to_string()],
        }
    }

    pub fn matches(&self, change: &RawChange) -> bool {
        if !self.ops.contains(&change.op) {
            return false;
        }
        change.op == ChangeOp::Insert
            || self.fields.is_empty()
            || self.fields.iter().any(|f| change.changed(f))
    }
}

pub type ChangeStream = BoxStream<'static, Result<RawChange>>;

/// Source of ride mutations.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a stream of changes after `resume_after` (or from the
    /// beginning). The stream ends or yields an error when the connection
    /// breaks; callers reopen it.
    async fn subscribe(
        &self,
        filter: ChangeFilter,
        resume_after: Option<ResumeToken>,
    ) -> Result<ChangeStream>;
}

/// Read access to current ride documents.
#[async_trait]
pub trait RideDocumentStore: Send + Sync {
    async fn get_ride(&self, id: &str) -> Result<Option<RideDocument>>;

    async fn rides_with_pickup_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RideDocument>>;
}

/// Durable per-subscription resume positions.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, subscription: &str) -> Result<Option<ResumeToken>>;
    async fn save(&self, subscription: &str, token: &ResumeToken) -> Result<()>;
}

/// What a subscription does with its changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Translate a status field transition.
    Status(StatusSpace),
    /// A new ride was created.
    Inserted,
    /// The driver field changed.
    Assignment,
    /// Record who changed what. No notification.
    Audit,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub name: &'static str,
    pub kind: SubscriptionKind,
    pub filter: ChangeFilter,
}

pub fn default_subscriptions() -> Vec<Subscription> {
    vec![
        Subscription {
            name: "progress_status",
            kind: SubscriptionKind::Status(StatusSpace::Progress),
            filter: ChangeFilter::updates_of(StatusSpace::Progress.field_name()),
        },
        Subscription {
            name: "workflow_status",
            kind: SubscriptionKind::Status(StatusSpace::Workflow),
            filter: ChangeFilter::updates_of(StatusSpace::Workflow.field_name()),
        },
        Subscription {
            name: "ride_inserts",
            kind: SubscriptionKind::Inserted,
            filter: ChangeFilter::inserts(),
        },
        Subscription {
            name: "assignment",
            kind: SubscriptionKind::Assignment,
            filter: ChangeFilter::updates_of("driver_id"),
        },
        Subscription {
            name: "audit_notes",
            kind: SubscriptionKind::Audit,
            filter: ChangeFilter::updates_of("notes"),
        },
        Subscription {
            name: "audit_editor",
            kind: SubscriptionKind::Audit,
            filter: ChangeFilter::updates_of("updated_by"),
        },
    ]
}

/// Reconnect backoff for broken streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSourceConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for ChangeSourceConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl ChangeSourceConfig {
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let next = Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff_multiplier)
            .unwrap_or(self.max_backoff);
        next.min(self.max_backoff)
    }
}

pub struct ChangeEventSource {
    feed: Arc<dyn ChangeFeed>,
    rides: Arc<dyn RideDocumentStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    bus: Arc<EventBus>,
    config: ChangeSourceConfig,
    subscriptions: Vec<Subscription>,
}

impl ChangeEventSource {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        rides: Arc<dyn RideDocumentStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        bus: Arc<EventBus>,
        config: ChangeSourceConfig,
    ) -> Self {
        Self {
            feed,
            rides,
            checkpoints,
            bus,
            config,
            subscriptions: default_subscriptions(),
        }
    }

    pub fn with_subscriptions(mut self, subscriptions: Vec<Subscription>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Spawn one task per subscription.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.subscriptions.len())
            .map(|idx| {
                let this = Arc::clone(self);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let sub = this.subscriptions[idx].clone();
                    this.run_subscription(&sub, cancel).await;
                })
            })
            .collect()
    }

    async fn run_subscription(&self, sub: &Subscription, cancel: CancellationToken) {
        let mut delay = self.config.initial_backoff;

        while !cancel.is_cancelled() {
            match self.stream_once(sub, &cancel).await {
                Ok(processed) => {
                    if processed > 0 {
                        delay = self.config.initial_backoff;
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(subscription = sub.name, "Change stream ended, reconnecting");
                }
                Err(e) => {
                    warn!(
                        subscription = sub.name,
                        error = %e,
                        retry_in = ?delay,
                        "Change stream failed, reconnecting"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.config.next_backoff(delay);
        }

        info!(subscription = sub.name, "Change subscription stopped");
    }

    /// Consume one stream until it ends, fails or `cancel` fires. Returns
    /// the number of changes processed.
    async fn stream_once(&self, sub: &Subscription, cancel: &CancellationToken) -> Result<usize> {
        let resume = self.checkpoints.load(sub.name).await?;
        let mut stream = self.feed.subscribe(sub.filter.clone(), resume.clone()).await?;
        info!(subscription = sub.name, resume_after = ?resume, "Change stream opened");

        let mut processed = 0;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(processed),
                next = stream.next() => next,
            };
            let Some(change) = next else {
                return Ok(processed);
            };
            let change = change?;

            self.process(sub, &change).await?;
            self.checkpoints.save(sub.name, &change.token).await?;
            processed += 1;
        }
    }

    /// Handle one change for `sub`. `None` when no event was published.
    pub async fn process(
        &self,
        sub: &Subscription,
        change: &RawChange,
    ) -> Result<Option<PublishReport>> {
        if !sub.filter.matches(change) {
            return Ok(None);
        }

        let Some(ride) = self.rides.get_ride(&change.document_id).await? else {
            debug!(
                subscription = sub.name,
                ride_id = %change.document_id,
                "Ride no longer exists, skipping change"
            );
            return Ok(None);
        };

        let event = match sub.kind {
            SubscriptionKind::Status(space) => {
                let field = space.field_name();
                let new = change
                    .new_i32(field)
                    .unwrap_or_else(|| ride.status_code(space));
                translator::translate(
                    &StatusChange::new(space, change.previous_i32(field), new),
                    &ride,
                )
            }
            SubscriptionKind::Inserted => translator::translate_insert(&ride),
            SubscriptionKind::Assignment => {
                translator::translate_assignment(change.previous_str("driver_id"), &ride)
            }
            SubscriptionKind::Audit => {
                info!(
                    subscription = sub.name,
                    ride_id = %ride.id,
                    fields = ?change.changed_fields.keys().collect::<Vec<_>>(),
                    updated_by = ?ride.updated_by,
                    "Ride audit change"
                );
                None
            }
        };

        let Some(event) = event else {
            return Ok(None);
        };
        let occurrence = format!("{}:{}", sub.name, change.token);
        let event = event.with_attribute(attr::OCCURRENCE, occurrence);

        let report = self.bus.publish(&event).await;
        debug!(
            subscription = sub.name,
            kind = %event.kind,
            ride_id = %event.ride_id,
            handled = report.handled,
            failed = report.failed,
            "Change published"
        );
        Ok(Some(report))
    }
}
