//! Trimming of the `ride_change` log.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::sqlite::{decode_change, token_id};
use super::{CheckpointStore, Subscription};
use crate::Result;
use crate::database::repositories::RideRepository;
use crate::scheduler::PeriodicTask;

#[derive(Debug, Clone)]
pub struct ChangeLogPruneConfig {
    pub interval: Duration,
    /// Log rows examined per pass.
    pub batch_size: i64,
}

impl Default for ChangeLogPruneConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            batch_size: 500,
        }
    }
}

/// Deletes the oldest log rows that no subscription can still receive.
///
/// A row is spent for a subscription once its checkpoint is at or past the
/// row, or when the subscription's filter does not match it. Pruning stops
/// at the first row some subscription still needs, so a subscription that
/// never saved a checkpoint only holds back the rows it would match.
pub struct ChangeLogPruner {
    rides: Arc<dyn RideRepository>,
    checkpoints: Arc<dyn CheckpointStore>,
    subscriptions: Vec<Subscription>,
    config: ChangeLogPruneConfig,
}

impl ChangeLogPruner {
    pub fn new(
        rides: Arc<dyn RideRepository>,
        checkpoints: Arc<dyn CheckpointStore>,
        subscriptions: Vec<Subscription>,
        config: ChangeLogPruneConfig,
    ) -> Self {
        Self {
            rides,
            checkpoints,
            subscriptions,
            config,
        }
    }

    /// One pass. Returns the number of rows deleted.
    pub async fn prune(&self) -> Result<u64> {
        let mut positions = Vec::with_capacity(self.subscriptions.len());
        for sub in &self.subscriptions {
            let after = match self.checkpoints.load(sub.name).await? {
                Some(token) => token_id(&token)?,
                None => 0,
            };
            positions.push((sub, after));
        }
        let Some(floor) = positions.iter().map(|(_, after)| *after).min() else {
            return Ok(0);
        };

        let mut through = floor;
        for row in self
            .rides
            .list_changes_after(floor, self.config.batch_size.max(1))
            .await?
        {
            // Undecodable rows are skipped by every stream.
            let needed = decode_change(&row).is_ok_and(|change| {
                positions
                    .iter()
                    .any(|(sub, after)| row.id > *after && sub.filter.matches(&change))
            });
            if needed {
                break;
            }
            through = row.id;
        }

        if through == 0 {
            return Ok(0);
        }
        let deleted = self.rides.delete_changes_through(through).await?;
        if deleted > 0 {
            info!(through, deleted, "Pruned ride change log");
        } else {
            debug!(through, "Ride change log already pruned");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl PeriodicTask for ChangeLogPruner {
    fn name(&self) -> &'static str {
        "change_log_prune"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> Result<usize> {
        let deleted = self.prune().await?;
        Ok(usize::try_from(deleted).unwrap_or(usize::MAX))
    }
}
