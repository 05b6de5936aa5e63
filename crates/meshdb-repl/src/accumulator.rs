//! Write accumulation: turns the writes of one local transaction into one
//! replication message per database.
//!
//! Replication happens after the local commit and never undoes it. A publish
//! failure is reported to the committer as
//! [`ReplError::ReplicationUnavailable`].

use crate::error::{ReplError, Result};
use crate::message::{ReplicationMessage, TableWrite, WriteBatch};
use crate::publisher::{unavailable, PublishOptions, Publisher};
use crate::subject::validate_token;
use std::sync::Arc;
use tracing::{debug, warn};

/// Group strictly consecutive writes that share `(table, operation)`.
///
/// A write that differs from the running batch always starts a new batch,
/// even if an earlier batch has the same `(table, operation)`.
pub fn batch_writes(writes: impl IntoIterator<Item = TableWrite>) -> Vec<WriteBatch> {
    let mut batches: Vec<WriteBatch> = Vec::new();
    for write in writes {
        match batches.last_mut() {
            Some(batch) if batch.accepts(&write) => batch.push(write),
            _ => batches.push(WriteBatch::from_write(write)),
        }
    }
    batches
}

/// Information supplied by the local store when its transaction commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitInfo {
    /// Commit timestamp of the local transaction (microseconds), if it has one.
    pub timestamp: Option<u64>,
    /// User that ran the transaction.
    pub user: Option<String>,
}

/// Transaction lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting writes.
    Open,
    /// Published; no further writes or commits.
    Committed,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Databases a message was published for, in first-write order.
    pub databases: Vec<String>,
    /// Total writes replicated.
    pub writes: usize,
}

/// Collects writes during one transaction and publishes them on commit.
pub struct ReplicationTransaction {
    publisher: Arc<Publisher>,
    writes: Vec<(String, Vec<TableWrite>)>,
    state: TransactionState,
}

impl ReplicationTransaction {
    /// Open a transaction.
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self {
            publisher,
            writes: Vec::new(),
            state: TransactionState::Open,
        }
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Number of writes waiting for commit.
    pub fn pending_writes(&self) -> usize {
        self.writes.iter().map(|(_, w)| w.len()).sum()
    }

    /// Record a write. No I/O.
    pub fn add_write(&mut self, database: &str, write: TableWrite) -> Result<()> {
        if self.state == TransactionState::Committed {
            return Err(ReplError::TransactionClosed);
        }
        validate_token("database", database)?;
        validate_token("table", &write.table)?;
        match self.writes.iter_mut().find(|(db, _)| db == database) {
            Some((_, list)) => list.push(write),
            None => self.writes.push((database.to_string(), vec![write])),
        }
        Ok(())
    }

    /// Publish one message per touched database and wait for every publish
    /// to settle. Every message carries the same origin. Failed databases are
    /// collected into one `ReplicationUnavailable` error; the others are
    /// still published.
    pub async fn commit(&mut self, info: CommitInfo) -> Result<CommitSummary> {
        if self.state == TransactionState::Committed {
            return Err(ReplError::TransactionClosed);
        }
        self.state = TransactionState::Committed;

        let pending = std::mem::take(&mut self.writes);
        let publisher = &self.publisher;
        if pending.is_empty() {
            return Ok(CommitSummary::default());
        }
        let origin = publisher.origin(info.timestamp, info.user);
        let messages: Vec<(String, ReplicationMessage)> = pending
            .into_iter()
            .filter_map(|(database, writes)| {
                ReplicationMessage::from_batches(
                    database.clone(),
                    batch_writes(writes),
                    origin.clone(),
                )
                .map(|message| (database, message))
            })
            .collect();

        let publishes = messages.iter().map(|(database, message)| async move {
            let result = publisher
                .publish_message(message, PublishOptions::default())
                .await;
            (database, message.write_count(), result)
        });
        let results = futures::future::join_all(publishes).await;

        let mut summary = CommitSummary::default();
        let mut failures = Vec::new();
        for (database, writes, result) in results {
            match result {
                Ok(()) => {
                    summary.databases.push(database.clone());
                    summary.writes += writes;
                }
                Err(e) => {
                    warn!(database = %database, error = %e, "replication publish failed after local commit");
                    failures.push((database.clone(), e.to_string()));
                }
            }
        }

        if !failures.is_empty() {
            return Err(ReplError::ReplicationUnavailable { failures });
        }
        debug!(databases = summary.databases.len(), writes = summary.writes, "transaction replicated");
        Ok(summary)
    }
}

impl Drop for ReplicationTransaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Open && !self.writes.is_empty() {
            debug!(writes = self.pending_writes(), "transaction discarded without commit");
        }
    }
}

/// Replicates writes issued outside any transaction, one message per write,
/// stamped from the node's monotonic clock.
#[derive(Clone)]
pub struct ImmediateReplicator {
    publisher: Arc<Publisher>,
}

impl ImmediateReplicator {
    /// Create a replicator.
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self { publisher }
    }

    /// Publish a single write right away.
    pub async fn add_write(&self, database: &str, write: TableWrite) -> Result<()> {
        validate_token("database", database)?;
        validate_token("table", &write.table)?;
        let origin = self.publisher.origin(None, None);
        let message = ReplicationMessage::from_batches(
            database,
            vec![WriteBatch::from_write(write)],
            origin,
        )
        .ok_or_else(|| ReplError::Decode {
            msg: "empty write".to_string(),
        })?;

        self.publisher
            .publish_message(&message, PublishOptions::default())
            .await
            .map_err(|e| unavailable(database, &e))
    }
}
