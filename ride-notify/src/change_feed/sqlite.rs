//! SQLite-backed change feed.
//!
//! Triggers on the `ride` table append every tracked mutation to
//! `ride_change`; the feed tails that log by id. The resume token is the
//! id of the last delivered log row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::{
    ChangeFeed, ChangeFilter, ChangeOp, ChangeStream, CheckpointStore, RawChange, ResumeToken,
    RideDocumentStore,
};
use crate::database::models::RideChangeDbModel;
use crate::database::repositories::{
    CheckpointRepository, RideRepository, SqlxCheckpointRepository, SqlxRideRepository,
};
use crate::database::time::{datetime_to_ms, ms_to_datetime};
use crate::domain::RideDocument;
use crate::{Error, Result};

const DEFAULT_BATCH_SIZE: i64 = 100;

/// Polls the `ride_change` log.
pub struct SqliteChangeFeed {
    rides: Arc<dyn RideRepository>,
    poll_interval: Duration,
    batch_size: i64,
}

impl SqliteChangeFeed {
    pub fn new(rides: Arc<dyn RideRepository>, poll_interval: Duration) -> Self {
        Self {
            rides,
            poll_interval,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

struct Cursor {
    rides: Arc<dyn RideRepository>,
    filter: ChangeFilter,
    after_id: i64,
    buffer: VecDeque<RawChange>,
    poll_interval: Duration,
    batch_size: i64,
    broken: bool,
}

#[async_trait]
impl ChangeFeed for SqliteChangeFeed {
    async fn subscribe(
        &self,
        filter: ChangeFilter,
        resume_after: Option<ResumeToken>,
    ) -> Result<ChangeStream> {
        let after_id = match resume_after {
            Some(token) => token_id(&token)?,
            None => 0,
        };

        let cursor = Cursor {
            rides: Arc::clone(&self.rides),
            filter,
            after_id,
            buffer: VecDeque::new(),
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            broken: false,
        };

        let stream = stream::unfold(cursor, |mut cursor| async move {
            if cursor.broken {
                return None;
            }
            loop {
                if let Some(change) = cursor.buffer.pop_front() {
                    return Some((Ok(change), cursor));
                }

                let rows = match cursor
                    .rides
                    .list_changes_after(cursor.after_id, cursor.batch_size)
                    .await
                {
                    Ok(rows) => rows,
                    Err(e) => {
                        // Yield the error once, then end; the subscriber reconnects.
                        cursor.broken = true;
                        return Some((Err(e), cursor));
                    }
                };

                if rows.is_empty() {
                    tokio::time::sleep(cursor.poll_interval).await;
                    continue;
                }

                for row in rows {
                    cursor.after_id = row.id;
                    match decode_change(&row) {
                        Ok(change) if cursor.filter.matches(&change) => {
                            cursor.buffer.push_back(change)
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(change_id = row.id, error = %e, "Skipping undecodable ride change");
                        }
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

/// Log row id a resume token points at.
pub(super) fn token_id(token: &ResumeToken) -> Result<i64> {
    token
        .as_str()
        .parse::<i64>()
        .map_err(|_| Error::change_feed(format!("invalid resume token '{}'", token)))
}

/// Turn a log row into a [`RawChange`] holding only the fields that moved.
pub(super) fn decode_change(row: &RideChangeDbModel) -> Result<RawChange> {
    let op = match row.op.as_str() {
        "insert" => ChangeOp::Insert,
        "update" => ChangeOp::Update,
        other => return Err(Error::change_feed(format!("unknown change op '{}'", other))),
    };

    let new_values = parse_object(&row.new_values)?;
    let old_values = match &row.old_values {
        Some(raw) => parse_object(raw)?,
        None => Map::new(),
    };

    let mut changed_fields = BTreeMap::new();
    let mut previous_values = BTreeMap::new();
    for (field, new) in new_values {
        match op {
            ChangeOp::Insert => {
                changed_fields.insert(field, new);
            }
            ChangeOp::Update => {
                let old = old_values.get(&field).cloned().unwrap_or(Value::Null);
                if old != new {
                    previous_values.insert(field.clone(), old);
                    changed_fields.insert(field, new);
                }
            }
        }
    }

    Ok(RawChange {
        token: ResumeToken(row.id.to_string()),
        op,
        document_id: row.ride_id.clone(),
        changed_fields,
        previous_values,
        occurred_at: ms_to_datetime(row.created_at),
    })
}

fn parse_object(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::change_feed("change values are not a JSON object")),
    }
}

#[async_trait]
impl RideDocumentStore for SqlxRideRepository {
    async fn get_ride(&self, id: &str) -> Result<Option<RideDocument>> {
        Ok(self.find_ride(id).await?.map(RideDocument::from))
    }

    async fn rides_with_pickup_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RideDocument>> {
        let rows = self
            .list_with_pickup_between(datetime_to_ms(from), datetime_to_ms(to))
            .await?;
        Ok(rows.into_iter().map(RideDocument::from).collect())
    }
}

#[async_trait]
impl CheckpointStore for SqlxCheckpointRepository {
    async fn load(&self, subscription: &str) -> Result<Option<ResumeToken>> {
        Ok(self.load_checkpoint(subscription).await?.map(ResumeToken))
    }

    async fn save(&self, subscription: &str, token: &ResumeToken) -> Result<()> {
        self.save_checkpoint(subscription, token.as_str()).await
    }
}
