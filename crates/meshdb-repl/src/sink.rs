//! Local table sinks and the registry the ingest pipeline dispatches to.

use crate::error::{ReplError, Result};
use crate::message::{Operation, Origin, ReplicationMessage, TableWrite};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Callback a sink invokes once its local apply has committed.
pub type OnCommit = Arc<dyn Fn(&Origin) + Send + Sync>;

/// What the sink should apply.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkPayload {
    /// Exactly one write with no chained batches.
    Write(TableWrite),
    /// Several writes, possibly across tables, in original order.
    Transaction(Vec<TableWrite>),
}

/// One dispatch to a sink.
#[derive(Clone)]
pub struct SinkEvent {
    /// Database of the message.
    pub database: String,
    /// Table the message was addressed to (its top-level table).
    pub table: String,
    /// Writes to apply.
    pub payload: SinkPayload,
    /// Origin timestamp; the write's last-write-wins time.
    pub timestamp: u64,
    /// Producer of the write.
    pub origin: Origin,
    on_commit: Option<OnCommit>,
}

impl SinkEvent {
    /// Build the dispatch event for a decoded message. A lone write becomes a
    /// `Write`; anything else is flattened into one `Transaction`.
    pub fn from_message(message: &ReplicationMessage, on_commit: Option<OnCommit>) -> Self {
        let payload = if message.is_single_write() {
            match message.head.writes().next() {
                Some(write) => SinkPayload::Write(write),
                None => SinkPayload::Transaction(Vec::new()),
            }
        } else {
            SinkPayload::Transaction(message.flatten())
        };
        Self {
            database: message.database.clone(),
            table: message.table().to_string(),
            payload,
            timestamp: message.origin.timestamp,
            origin: message.origin.clone(),
            on_commit,
        }
    }

    /// `Transaction` for multi-write events, otherwise the write's operation.
    pub fn operation(&self) -> Operation {
        match &self.payload {
            SinkPayload::Write(write) => write.operation,
            SinkPayload::Transaction(_) => Operation::Transaction,
        }
    }

    /// Value of a single-write event: the record, or the id for id-only operations.
    pub fn value(&self) -> Option<&Value> {
        match &self.payload {
            SinkPayload::Write(write) => write.record.as_ref().or(Some(&write.id)),
            SinkPayload::Transaction(_) => None,
        }
    }

    /// Every write in the event, in order.
    pub fn writes(&self) -> Vec<&TableWrite> {
        match &self.payload {
            SinkPayload::Write(write) => vec![write],
            SinkPayload::Transaction(writes) => writes.iter().collect(),
        }
    }

    /// Report that the local apply committed.
    pub fn commit(&self) {
        if let Some(on_commit) = &self.on_commit {
            on_commit(&self.origin);
        }
    }
}

impl std::fmt::Debug for SinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkEvent")
            .field("database", &self.database)
            .field("table", &self.table)
            .field("payload", &self.payload)
            .field("timestamp", &self.timestamp)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Applies replicated writes to a local table.
#[async_trait]
pub trait TableSink: Send + Sync {
    /// Apply an event. The pipeline does not wait for this before acking;
    /// it only holds an in-flight slot until it resolves.
    async fn send(&self, event: SinkEvent) -> Result<()>;
}

/// Sink that forwards events to a channel for another task to apply.
#[derive(Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl TableSink for ChannelSink {
    async fn send(&self, event: SinkEvent) -> Result<()> {
        let (database, table) = (event.database.clone(), event.table.clone());
        self.sender.send(event).map_err(|_| ReplError::ApplyFailure {
            database,
            table,
            msg: "sink receiver dropped".to_string(),
        })
    }
}

/// Registered sinks by `(database, table)`.
///
/// Sinks are registered by the local store when a table is first used.
/// Looking one up never creates it.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: DashMap<(String, String), Arc<dyn TableSink>>,
}

impl SinkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the sink for a table.
    pub fn set_subscription(&self, database: &str, table: &str, sink: Arc<dyn TableSink>) {
        self.sinks
            .insert((database.to_string(), table.to_string()), sink);
    }

    /// Remove a table's sink. Returns true if one was registered.
    pub fn remove_subscription(&self, database: &str, table: &str) -> bool {
        self.sinks
            .remove(&(database.to_string(), table.to_string()))
            .is_some()
    }

    /// The sink for a table, or `UnknownSink`.
    pub fn get(&self, database: &str, table: &str) -> Result<Arc<dyn TableSink>> {
        self.sinks
            .get(&(database.to_string(), table.to_string()))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ReplError::UnknownSink {
                database: database.to_string(),
                table: table.to_string(),
            })
    }

    /// Registered `(database, table)` pairs, sorted.
    pub fn tables(&self) -> Vec<(String, String)> {
        let mut tables: Vec<_> = self.sinks.iter().map(|e| e.key().clone()).collect();
        tables.sort();
        tables
    }

    /// Number of registered sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns true if no sinks are registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WriteBatch;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(batches: Vec<WriteBatch>) -> ReplicationMessage {
        ReplicationMessage::from_batches("dev", batches, Origin::new("west", 77)).unwrap()
    }

    #[test]
    fn test_single_write_event() {
        let msg = message(vec![WriteBatch::from_write(TableWrite::put(
            "orders",
            1,
            json!({"id": 1, "qty": 2}),
        ))]);
        let event = SinkEvent::from_message(&msg, None);

        assert_eq!(event.operation(), Operation::Put);
        assert_eq!(event.value(), Some(&json!({"id": 1, "qty": 2})));
        assert_eq!(event.timestamp, 77);
        assert_eq!(event.origin.node_name, "west");
    }

    #[test]
    fn test_single_delete_value_is_id() {
        let msg = message(vec![WriteBatch::from_write(TableWrite::delete("orders", 5))]);
        let event = SinkEvent::from_message(&msg, None);
        assert_eq!(event.operation(), Operation::Delete);
        assert_eq!(event.value(), Some(&json!(5)));
    }

    #[test]
    fn test_batched_records_become_transaction() {
        let mut batch = WriteBatch::from_write(TableWrite::put("orders", 1, json!({"id": 1})));
        batch.push(TableWrite::put("orders", 2, json!({"id": 2})));
        let event = SinkEvent::from_message(&message(vec![batch]), None);

        assert_eq!(event.operation(), Operation::Transaction);
        assert_eq!(event.writes().len(), 2);
        assert!(event.value().is_none());
    }

    #[test]
    fn test_chain_becomes_ordered_transaction() {
        let msg = message(vec![
            WriteBatch::from_write(TableWrite::put("orders", 1, json!({"id": 1}))),
            WriteBatch::from_write(TableWrite::put("items", 9, json!({"id": 9}))),
        ]);
        let event = SinkEvent::from_message(&msg, None);
        let order: Vec<_> = event.writes().iter().map(|w| w.table.clone()).collect();
        assert_eq!(order, vec!["orders", "items"]);
        assert_eq!(event.table, "orders");
    }

    #[test]
    fn test_commit_invokes_hook() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let hook: OnCommit = Arc::new(move |origin: &Origin| {
            assert_eq!(origin.node_name, "west");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let msg = message(vec![WriteBatch::from_write(TableWrite::delete("orders", 1))]);
        let event = SinkEvent::from_message(&msg, Some(hook));
        event.commit();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        SinkEvent::from_message(&msg, None).commit();
    }

    #[test]
    fn test_registry_lookup_never_creates() {
        let registry = SinkRegistry::new();
        assert!(matches!(
            registry.get("dev", "orders"),
            Err(ReplError::UnknownSink { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_set_get_remove() {
        let registry = SinkRegistry::new();
        let (sink, _rx) = ChannelSink::new();
        registry.set_subscription("dev", "orders", Arc::new(sink.clone()));
        registry.set_subscription("dev", "items", Arc::new(sink));

        assert!(registry.get("dev", "orders").is_ok());
        assert!(registry.get("Dev", "orders").is_err());
        assert_eq!(
            registry.tables(),
            vec![
                ("dev".to_string(), "items".to_string()),
                ("dev".to_string(), "orders".to_string())
            ]
        );
        assert!(registry.remove_subscription("dev", "orders"));
        assert!(!registry.remove_subscription("dev", "orders"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        let msg = message(vec![WriteBatch::from_write(TableWrite::delete("orders", 1))]);
        sink.send(SinkEvent::from_message(&msg, None)).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.table, "orders");
    }

    #[tokio::test]
    async fn test_channel_sink_closed_is_apply_failure() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        let msg = message(vec![WriteBatch::from_write(TableWrite::delete("orders", 1))]);
        let result = sink.send(SinkEvent::from_message(&msg, None)).await;
        assert!(matches!(result, Err(ReplError::ApplyFailure { .. })));
    }
}
