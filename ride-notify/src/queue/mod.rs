//! Durable priority notification queue.
//!
//! Items live in SQLite and move through the [`NotificationStatus`] state
//! machine. Claiming is a single conditional `UPDATE`, so any number of
//! dispatchers (in this process or others sharing the database) can race
//! for the same item and exactly one wins. Every other mutation is a
//! read-modify-write guarded by the row `version`.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::database::models::{NotificationItemDbModel, StatusCounts};
use crate::database::repositories::{InsertOutcome, NotificationRepository};
use crate::database::time::now_ms;
use crate::domain::{
    BackoffPolicy, FailureSource, NewNotification, NotificationItem, NotificationStatus,
    RetryHistoryEntry,
};
use crate::{Error, Result};

/// Something that drains the queue and can be nudged when work arrives.
pub trait DispatchWaker: Send + Sync {
    /// Make sure the dispatch loop is running and has noticed new work.
    fn wake(&self);
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backoff: BackoffPolicy,
    /// Attempts at an optimistic update before giving up.
    pub max_update_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_update_attempts: 8,
        }
    }
}

/// What happened to an item after a failure was reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FailureOutcome {
    /// Back to `pending`, eligible again at `next_attempt_at`.
    Requeued {
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Terminal `failed`.
    Failed { retry_count: u32 },
    /// The item was not in a state the failure applies to. Nothing changed.
    Ignored { status: NotificationStatus },
}

/// Result of a positive delivery receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Confirmed,
    AlreadyConfirmed,
    Ignored { status: NotificationStatus },
}

/// Snapshot of queue depth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    #[serde(flatten)]
    pub counts: StatusCounts,
    pub total: u64,
}

/// Internal description of a reported failure.
#[derive(Debug, Clone)]
struct FailureReport {
    source: FailureSource,
    reason: String,
    error_code: Option<String>,
    /// Whether the failure uses up one unit of retry budget.
    consume_retry: bool,
}

enum Applied<T> {
    Written(T),
    Skipped(NotificationStatus),
}

pub struct NotificationQueue {
    repo: Arc<dyn NotificationRepository>,
    config: QueueConfig,
    notify: Arc<Notify>,
    dispatcher: RwLock<Option<Weak<dyn DispatchWaker>>>,
}

impl NotificationQueue {
    pub fn new(repo: Arc<dyn NotificationRepository>, config: QueueConfig) -> Self {
        Self {
            repo,
            config,
            notify: Arc::new(Notify::new()),
            dispatcher: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Signalled whenever an item is enqueued.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Register the dispatcher to wake on enqueue. Held weakly.
    pub fn attach_dispatcher(&self, dispatcher: Weak<dyn DispatchWaker>) {
        *self.dispatcher.write() = Some(dispatcher);
    }

    fn wake_dispatcher(&self) {
        self.notify.notify_one();
        let dispatcher = self.dispatcher.read().as_ref().and_then(Weak::upgrade);
        if let Some(dispatcher) = dispatcher {
            dispatcher.wake();
        }
    }

    /// Persist a new `pending` item and return its id.
    ///
    /// If `dedupe_key` matches an existing item, nothing is written and the
    /// existing id is returned.
    pub async fn enqueue(&self, new: NewNotification) -> Result<String> {
        new.validate()?;
        let row =
            NotificationItemDbModel::from_new(&new, self.config.backoff.max_retries, now_ms())?;

        match self.repo.insert_item(&row).await? {
            InsertOutcome::Inserted(id) => {
                info!(
                    id = %id,
                    channel = %new.channel,
                    priority = %new.priority,
                    correlation_id = ?new.metadata.correlation_id,
                    kind = ?new.metadata.kind,
                    scheduled = ?new.scheduled_time,
                    "Notification enqueued"
                );
                self.wake_dispatcher();
                Ok(id)
            }
            InsertOutcome::Duplicate(id) => {
                debug!(
                    id = %id,
                    dedupe_key = ?new.dedupe_key,
                    "Duplicate notification suppressed"
                );
                Ok(id)
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<NotificationItem> {
        self.repo.get_item(id).await?.into_domain()
    }

    /// Pending items due now, highest priority first, FIFO within a priority.
    pub async fn list_eligible(&self, limit: usize) -> Result<Vec<NotificationItem>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self.repo.list_eligible(now_ms(), limit).await?;
        Ok(Self::convert_rows(rows))
    }

    /// Atomically take a pending, due item. `false` if someone else got it
    /// first or it is no longer eligible.
    pub async fn claim(&self, id: &str) -> Result<bool> {
        let claimed = self.repo.claim_item(id, now_ms()).await?;
        if claimed {
            debug!(id = %id, "Notification claimed");
        }
        Ok(claimed)
    }

    /// `processing -> sent`. Returns `false` if the item was no longer
    /// processing, e.g. cancelled while the send was in flight.
    pub async fn mark_sent(&self, id: &str, provider_message_ref: Option<String>) -> Result<bool> {
        let applied = self
            .modify(id, "mark_sent", |item, _now| {
                if item.status != NotificationStatus::Processing {
                    return Ok(None);
                }
                item.status = item.status.transition(NotificationStatus::Sent)?;
                item.metadata.provider_message_ref = provider_message_ref.clone();
                item.claimed_at = None;
                Ok(Some(()))
            })
            .await?;

        match applied {
            Applied::Written(()) => {
                info!(id = %id, provider_ref = ?provider_message_ref, "Notification sent");
                Ok(true)
            }
            Applied::Skipped(status) => {
                warn!(id = %id, status = %status, "Send finished but item is no longer processing");
                Ok(false)
            }
        }
    }

    /// Record a retryable send failure on a processing item.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<FailureOutcome> {
        self.fail(
            id,
            &[NotificationStatus::Processing],
            FailureReport {
                source: FailureSource::SendFailure,
                reason: reason.to_string(),
                error_code: None,
                consume_retry: true,
            },
        )
        .await
    }

    /// Record a non-retryable send failure on a processing item.
    pub async fn mark_failed_permanently(&self, id: &str, reason: &str) -> Result<FailureOutcome> {
        self.fail(
            id,
            &[NotificationStatus::Processing],
            FailureReport {
                source: FailureSource::Rejected,
                reason: reason.to_string(),
                error_code: None,
                consume_retry: false,
            },
        )
        .await
    }

    /// Return an abandoned claim to the retry path.
    pub async fn release_stale(&self, id: &str, reason: &str) -> Result<FailureOutcome> {
        self.fail(
            id,
            &[NotificationStatus::Processing],
            FailureReport {
                source: FailureSource::StaleClaim,
                reason: reason.to_string(),
                error_code: None,
                consume_retry: true,
            },
        )
        .await
    }

    /// Apply a negative delivery receipt to a sent item.
    ///
    /// Retryable failures consume retry budget like a send failure; the
    /// others fail the item without touching `retry_count`.
    pub async fn fail_from_receipt(
        &self,
        id: &str,
        reason: &str,
        error_code: Option<&str>,
        retryable: bool,
    ) -> Result<FailureOutcome> {
        self.fail(
            id,
            &[NotificationStatus::Sent],
            FailureReport {
                source: FailureSource::Receipt,
                reason: reason.to_string(),
                error_code: error_code.map(str::to_string),
                consume_retry: retryable,
            },
        )
        .await
    }

    /// Record a positive delivery receipt. The item stays `sent`.
    pub async fn confirm_delivery(&self, id: &str) -> Result<ConfirmOutcome> {
        let applied = self
            .modify(id, "confirm_delivery", |item, now| {
                if item.status != NotificationStatus::Sent {
                    return Ok(None);
                }
                if item.metadata.delivery_confirmed {
                    return Ok(Some(ConfirmOutcome::AlreadyConfirmed));
                }
                item.metadata.delivery_confirmed = true;
                item.metadata.delivery_confirmed_at = Some(now);
                Ok(Some(ConfirmOutcome::Confirmed))
            })
            .await?;

        Ok(match applied {
            Applied::Written(outcome) => outcome,
            Applied::Skipped(status) => ConfirmOutcome::Ignored { status },
        })
    }

    /// Cancel a pending or processing item. `false` if it was already terminal.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let cancelled = self.repo.cancel_item(id, now_ms()).await?;
        if cancelled {
            info!(id = %id, "Notification cancelled");
        } else if self.repo.find_item(id).await?.is_none() {
            return Err(Error::not_found("NotificationItem", id));
        }
        Ok(cancelled)
    }

    /// Cancel every pending or processing item of a correlation group.
    pub async fn cancel_by_correlation(&self, correlation_id: &str) -> Result<u64> {
        let count = self
            .repo
            .cancel_by_correlation(correlation_id, now_ms())
            .await?;
        if count > 0 {
            info!(correlation_id = %correlation_id, count, "Cancelled outstanding notifications");
        }
        Ok(count)
    }

    /// Cancel the outstanding items of `kind` in a correlation group that
    /// were produced by an occurrence other than `occurrence`.
    pub async fn cancel_superseded(
        &self,
        correlation_id: &str,
        kind: &str,
        occurrence: &str,
    ) -> Result<u64> {
        let mut count = 0;
        for item in self.history(correlation_id).await? {
            let superseded = item.status.is_cancellable()
                && item.metadata.kind.as_deref() == Some(kind)
                && item.occurrence() != Some(occurrence);
            if superseded && self.cancel(&item.id).await? {
                count += 1;
            }
        }
        if count > 0 {
            info!(
                correlation_id = %correlation_id,
                kind = %kind,
                count,
                "Cancelled superseded notifications"
            );
        }
        Ok(count)
    }

    /// Every item of a correlation group, oldest first.
    pub async fn history(&self, correlation_id: &str) -> Result<Vec<NotificationItem>> {
        let rows = self.repo.list_by_correlation(correlation_id).await?;
        Ok(Self::convert_rows(rows))
    }

    pub async fn find_by_provider_ref(&self, provider_ref: &str) -> Result<Option<NotificationItem>> {
        self.repo
            .find_by_provider_ref(provider_ref)
            .await?
            .map(NotificationItemDbModel::into_domain)
            .transpose()
    }

    /// Processing items whose claim is older than `older_than`.
    pub async fn stale_processing(
        &self,
        older_than: Duration,
        limit: usize,
    ) -> Result<Vec<NotificationItem>> {
        let cutoff = now_ms().saturating_sub(i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX));
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self.repo.list_stale_processing(cutoff, limit).await?;
        Ok(Self::convert_rows(rows))
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let counts = self.repo.count_by_status().await?;
        Ok(QueueStats {
            total: counts.total(),
            counts,
        })
    }

    /// Startup report. Leftover `processing` items are picked up by the
    /// stale sweep once their claim ages out.
    pub async fn recover(&self) -> Result<QueueStats> {
        let stats = self.stats().await?;
        info!(
            pending = stats.counts.pending,
            processing = stats.counts.processing,
            total = stats.total,
            "Notification queue recovered"
        );
        if stats.counts.pending > 0 {
            self.wake_dispatcher();
        }
        Ok(stats)
    }

    async fn fail(
        &self,
        id: &str,
        allowed_from: &[NotificationStatus],
        report: FailureReport,
    ) -> Result<FailureOutcome> {
        let backoff = &self.config.backoff;
        let applied = self
            .modify(id, "record_failure", |item, now| {
                if !allowed_from.contains(&item.status) {
                    return Ok(None);
                }
                apply_failure(item, now, backoff, &report).map(Some)
            })
            .await?;

        let outcome = match applied {
            Applied::Written(outcome) => outcome,
            Applied::Skipped(status) => {
                debug!(id = %id, status = %status, source = %report.source, "Failure report ignored");
                return Ok(FailureOutcome::Ignored { status });
            }
        };

        match &outcome {
            FailureOutcome::Requeued {
                retry_count,
                next_attempt_at,
            } => {
                warn!(
                    id = %id,
                    source = %report.source,
                    retry_count,
                    next_attempt_at = %next_attempt_at,
                    reason = %report.reason,
                    "Notification attempt failed, will retry"
                );
                self.wake_dispatcher();
            }
            FailureOutcome::Failed { retry_count } => {
                warn!(
                    id = %id,
                    source = %report.source,
                    retry_count,
                    reason = %report.reason,
                    "Notification failed permanently"
                );
            }
            FailureOutcome::Ignored { .. } => {}
        }
        Ok(outcome)
    }

    /// Optimistic read-modify-write. `f` returns `None` to leave the item
    /// untouched.
    async fn modify<T, F>(&self, id: &str, op: &'static str, mut f: F) -> Result<Applied<T>>
    where
        F: FnMut(&mut NotificationItem, DateTime<Utc>) -> Result<Option<T>>,
    {
        for attempt in 1..=self.config.max_update_attempts {
            let mut item = self.repo.get_item(id).await?.into_domain()?;
            let expected_status = item.status;
            let expected_version = item.version;
            let now = Utc::now();

            let Some(value) = f(&mut item, now)? else {
                return Ok(Applied::Skipped(expected_status));
            };
            item.updated_at = now;

            let row = NotificationItemDbModel::from_domain(&item)?;
            if self
                .repo
                .update_item_if_unchanged(&row, expected_status, expected_version)
                .await?
            {
                return Ok(Applied::Written(value));
            }
            debug!(id = %id, op, attempt, "Concurrent modification, re-reading item");
        }

        Err(Error::Other(format!(
            "{op}: item {id} kept changing after {} attempts",
            self.config.max_update_attempts
        )))
    }

    fn convert_rows(rows: Vec<NotificationItemDbModel>) -> Vec<NotificationItem> {
        rows.into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                match row.into_domain() {
                    Ok(item) => Some(item),
                    Err(e) => {
                        warn!(id = %id, error = %e, "Skipping unreadable notification row");
                        None
                    }
                }
            })
            .collect()
    }
}

/// Move a failed item to `pending` (budget left) or terminal `failed`.
///
/// The status passes through `failed` either way; a retry is the composite
/// `failed -> pending` step with the next attempt scheduled from the
/// backoff table.
fn apply_failure(
    item: &mut NotificationItem,
    now: DateTime<Utc>,
    backoff: &BackoffPolicy,
    report: &FailureReport,
) -> Result<FailureOutcome> {
    item.status = item.status.transition(NotificationStatus::Failed)?;

    if report.consume_retry && item.retry_count < item.max_retries {
        item.retry_count += 1;
    }
    let retry =
        report.consume_retry && BackoffPolicy::should_retry(item.retry_count, item.max_retries);

    let next_attempt_at = retry.then(|| {
        let delay = backoff.delay_after(item.retry_count);
        TimeDelta::from_std(delay)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    });

    item.metadata.retry_history.push(RetryHistoryEntry {
        attempt: item.retry_count,
        source: report.source,
        reason: report.reason.clone(),
        error_code: report.error_code.clone(),
        failed_at: now,
        next_attempt_at,
    });
    item.last_error = Some(report.reason.clone());
    item.claimed_at = None;

    match next_attempt_at {
        Some(at) => {
            item.status = item.status.transition(NotificationStatus::Pending)?;
            item.scheduled_time = Some(at);
            Ok(FailureOutcome::Requeued {
                retry_count: item.retry_count,
                next_attempt_at: at,
            })
        }
        None => Ok(FailureOutcome::Failed {
            retry_count: item.retry_count,
        }),
    }
}
