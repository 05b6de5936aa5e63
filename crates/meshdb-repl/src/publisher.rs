//! Publishes replication messages to a table's stream.
//!
//! Streams are created lazily: the first publish for a table usually finds no
//! stream, so the publisher creates one scoped to exactly that subject and
//! retries once. Any failure after that is returned to the caller.

use crate::broker::{Headers, SharedBroker};
use crate::clock::NodeClock;
use crate::config::ReplicationConfig;
use crate::error::{ReplError, Result};
use crate::message::{extend_origin_chain, Origin, ReplicationMessage};
use crate::stream_key::{StreamKey, StreamNamer};
use crate::subject::{validate_token, SubjectScheme};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Per-call publish options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Wait for the broker to acknowledge everything published so far.
    /// Administrative operations always flush.
    pub flush: bool,
}

impl PublishOptions {
    /// Options requesting a flush.
    pub fn flushed() -> Self {
        Self { flush: true }
    }
}

#[derive(Debug, Default)]
struct PublisherStatsInner {
    published: AtomicU64,
    relayed: AtomicU64,
    streams_created: AtomicU64,
    failures: AtomicU64,
    flushes: AtomicU64,
}

/// Snapshot of publisher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Messages published on this node's table subjects.
    pub published: u64,
    /// Messages relayed to canonical table subjects.
    pub relayed: u64,
    /// Streams created on first publish.
    pub streams_created: u64,
    /// Publishes that failed even after stream creation.
    pub failures: u64,
    /// Broker flushes performed.
    pub flushes: u64,
}

/// Encodes and publishes messages for one node.
pub struct Publisher {
    broker: SharedBroker,
    namer: Arc<StreamNamer>,
    subjects: SubjectScheme,
    node_name: String,
    clock: Arc<NodeClock>,
    stats: PublisherStatsInner,
}

impl Publisher {
    /// Create a publisher for the configured node.
    pub fn new(config: &ReplicationConfig, broker: SharedBroker) -> Self {
        Self {
            broker,
            namer: Arc::new(StreamNamer::new(config.granularity)),
            subjects: SubjectScheme::new(config.subject_prefix.clone()),
            node_name: config.node_name.clone(),
            clock: Arc::new(NodeClock::new()),
            stats: PublisherStatsInner::default(),
        }
    }

    /// This node's name.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Stream namer shared with the ingest side.
    pub fn namer(&self) -> &Arc<StreamNamer> {
        &self.namer
    }

    /// Subject scheme.
    pub fn subjects(&self) -> &SubjectScheme {
        &self.subjects
    }

    /// Node clock used for origin timestamps.
    pub fn clock(&self) -> &Arc<NodeClock> {
        &self.clock
    }

    /// Broker handle.
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    /// Origin for a new message, stamped from the node clock. A supplied
    /// timestamp is used if it does not move the clock backwards.
    pub fn origin(&self, timestamp: Option<u64>, user: Option<String>) -> Origin {
        let timestamp = match timestamp {
            Some(ts) => self.clock.observe(ts),
            None => self.clock.now_us(),
        };
        Origin {
            timestamp,
            user,
            node_name: self.node_name.clone(),
        }
    }

    /// Publish a message on this node's subject for its database and table.
    pub async fn publish_message(
        &self,
        message: &ReplicationMessage,
        options: PublishOptions,
    ) -> Result<()> {
        validate_token("database", &message.database)?;
        validate_token("table", message.table())?;
        let key = self
            .namer
            .derive_stream_key(&message.database, message.table());
        let subject = self
            .subjects
            .table_subject(&message.database, message.table(), &self.node_name);
        self.publish(&key, &subject, Headers::new(), message, options)
            .await
    }

    /// Encode `payload`, add this node to the origin header and publish it.
    pub async fn publish(
        &self,
        stream_key: &StreamKey,
        subject: &str,
        mut headers: Headers,
        payload: &ReplicationMessage,
        options: PublishOptions,
    ) -> Result<()> {
        let bytes = payload.encode()?;
        extend_origin_chain(&mut headers, &self.node_name);

        self.publish_bytes(stream_key, subject, bytes, headers)
            .await?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            database = %payload.database,
            table = payload.table(),
            subject,
            writes = payload.write_count(),
            "published replication message"
        );

        if options.flush || payload.batches().any(|b| b.operation.is_administrative()) {
            self.broker.flush().await?;
            self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Republish already-encoded bytes on the table's canonical subject so
    /// nodes sourcing from this one receive it too.
    pub async fn relay(
        &self,
        database: &str,
        table: &str,
        payload: Bytes,
        mut headers: Headers,
    ) -> Result<()> {
        validate_token("database", database)?;
        validate_token("table", table)?;
        let key = self.namer.derive_stream_key(database, table);
        let subject = self.subjects.canonical_subject(database, table);
        extend_origin_chain(&mut headers, &self.node_name);

        self.publish_bytes(&key, &subject, payload, headers).await?;
        self.stats.relayed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn publish_bytes(
        &self,
        stream_key: &StreamKey,
        subject: &str,
        payload: Bytes,
        headers: Headers,
    ) -> Result<()> {
        let first = self
            .broker
            .publish(subject, payload.clone(), headers.clone())
            .await;
        let result = match first {
            Ok(()) => Ok(()),
            Err(e) if e.is_missing_stream() => {
                info!(stream = %stream_key, subject, "stream missing, creating it");
                self.broker
                    .create_stream(stream_key.as_str(), &[subject.to_string()])
                    .await?;
                self.stats.streams_created.fetch_add(1, Ordering::Relaxed);
                self.broker.publish(subject, payload, headers).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            error!(stream = %stream_key, subject, error = %e, "publish failed");
        }
        result
    }

    /// Get a snapshot of current statistics.
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.stats.published.load(Ordering::Relaxed),
            relayed: self.stats.relayed.load(Ordering::Relaxed),
            streams_created: self.stats.streams_created.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("node_name", &self.node_name)
            .field("subjects", &self.subjects)
            .finish()
    }
}

/// Map a publish failure for `database` into the error reported to writers.
pub(crate) fn unavailable(database: &str, err: &ReplError) -> ReplError {
    ReplError::ReplicationUnavailable {
        failures: vec![(database.to_string(), err.to_string())],
    }
}
