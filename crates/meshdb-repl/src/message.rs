//! Wire format for replicated table writes.
//!
//! One message carries the writes of one database from one committed
//! transaction. The first run of writes sharing a `(table, operation)` sits at
//! the top level; every later run is appended to `next` in commit order.

use crate::broker::Headers;
use crate::error::{ReplError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header listing the nodes that have already applied a message.
pub const ORIGIN_HEADER: &str = "origin";

/// Header that disables echo suppression for one message when set to `true`.
pub const REPLAY_HEADER: &str = "replay";

/// Table operation carried by a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Insert or replace a record.
    Put,
    /// Delete a record by id.
    Delete,
    /// Publish a message record without persisting it as table state.
    Publish,
    /// Partial update of a record.
    Patch,
    /// Invalidate a cached record.
    Invalidate,
    /// Multi-table transaction (sink events only).
    Transaction,
    /// Schema definition change.
    DefineSchema,
}

impl Operation {
    /// Whether writes of this kind carry a record body, not just an id.
    pub fn carries_record(&self) -> bool {
        !matches!(self, Self::Delete | Self::Invalidate)
    }

    /// Administrative operations are flushed to the broker before returning.
    pub fn is_administrative(&self) -> bool {
        matches!(self, Self::DefineSchema)
    }
}

/// Who produced a message and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Node-local logical clock value (microseconds).
    pub timestamp: u64,
    /// User that issued the write, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Name of the producing node.
    pub node_name: String,
}

impl Origin {
    /// Create an origin with no user.
    pub fn new(node_name: impl Into<String>, timestamp: u64) -> Self {
        Self {
            timestamp,
            user: None,
            node_name: node_name.into(),
        }
    }
}

/// A single table write, as accumulated locally and as delivered to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableWrite {
    /// Target table.
    pub table: String,
    /// Operation to apply.
    pub operation: Operation,
    /// Primary key of the record.
    pub id: Value,
    /// Record body, absent for deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    /// Expiration time of the record (ms since epoch), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl TableWrite {
    /// A put of `record` under `id`.
    pub fn put(table: impl Into<String>, id: impl Into<Value>, record: Value) -> Self {
        Self::new(table, Operation::Put, id, Some(record))
    }

    /// A delete of `id`.
    pub fn delete(table: impl Into<String>, id: impl Into<Value>) -> Self {
        Self::new(table, Operation::Delete, id, None)
    }

    /// A write with an explicit operation.
    pub fn new(
        table: impl Into<String>,
        operation: Operation,
        id: impl Into<Value>,
        record: Option<Value>,
    ) -> Self {
        Self {
            table: table.into(),
            operation,
            id: id.into(),
            record,
            expires_at: None,
        }
    }

    /// Set the expiration time.
    pub fn with_expires_at(mut self, expires_at: u64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

fn all_none(values: &[Option<u64>]) -> bool {
    values.iter().all(Option::is_none)
}

/// A run of writes sharing one `(table, operation)`.
///
/// `ids` always has one entry per write; `records` is parallel to it for
/// record-carrying operations and empty otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    /// Target table.
    pub table: String,
    /// Operation shared by every write in the batch.
    pub operation: Operation,
    /// Record bodies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<Value>,
    /// Primary keys.
    #[serde(default, alias = "hash_values")]
    pub ids: Vec<Value>,
    /// Per-write expiration, omitted on the wire when no write expires.
    #[serde(default, skip_serializing_if = "all_none")]
    pub expires_at: Vec<Option<u64>>,
}

impl WriteBatch {
    /// Start a batch from its first write.
    pub fn from_write(write: TableWrite) -> Self {
        let mut batch = Self {
            table: write.table.clone(),
            operation: write.operation,
            records: Vec::new(),
            ids: Vec::new(),
            expires_at: Vec::new(),
        };
        batch.push(write);
        batch
    }

    /// Whether `write` may join this batch.
    pub fn accepts(&self, write: &TableWrite) -> bool {
        self.table == write.table && self.operation == write.operation
    }

    /// Append a write. Callers check [`accepts`](Self::accepts) first.
    pub fn push(&mut self, write: TableWrite) {
        if self.operation.carries_record() {
            self.records.push(write.record.unwrap_or(Value::Null));
        }
        self.ids.push(write.id);
        self.expires_at.push(write.expires_at);
    }

    /// Number of writes in the batch.
    pub fn len(&self) -> usize {
        self.ids.len().max(self.records.len())
    }

    /// Returns true if the batch holds no writes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Expand back into individual writes, in order.
    pub fn writes(&self) -> impl Iterator<Item = TableWrite> + '_ {
        (0..self.len()).map(move |i| TableWrite {
            table: self.table.clone(),
            operation: self.operation,
            id: self.ids.get(i).cloned().unwrap_or(Value::Null),
            record: self.records.get(i).cloned(),
            expires_at: self.expires_at.get(i).copied().flatten(),
        })
    }
}

/// A replication message as published on the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMessage {
    /// Database every write in the message belongs to.
    pub database: String,
    /// First batch; its table and operation are the message's.
    #[serde(flatten)]
    pub head: WriteBatch,
    /// Further batches in commit order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<WriteBatch>,
    /// Producer of the message.
    #[serde(rename = "__origin")]
    pub origin: Origin,
}

impl ReplicationMessage {
    /// Build a message from ordered batches. Returns `None` if there are none.
    pub fn from_batches(
        database: impl Into<String>,
        batches: Vec<WriteBatch>,
        origin: Origin,
    ) -> Option<Self> {
        let mut iter = batches.into_iter();
        let head = iter.next()?;
        Some(Self {
            database: database.into(),
            head,
            next: iter.collect(),
            origin,
        })
    }

    /// Table of the top-level batch.
    pub fn table(&self) -> &str {
        &self.head.table
    }

    /// Operation of the top-level batch.
    pub fn operation(&self) -> Operation {
        self.head.operation
    }

    /// All batches, head first.
    pub fn batches(&self) -> impl Iterator<Item = &WriteBatch> {
        std::iter::once(&self.head).chain(self.next.iter())
    }

    /// Total number of writes across all batches.
    pub fn write_count(&self) -> usize {
        self.batches().map(WriteBatch::len).sum()
    }

    /// A message with exactly one write and no chained batches.
    pub fn is_single_write(&self) -> bool {
        self.next.is_empty() && self.head.len() == 1
    }

    /// Every write in the message, in original chain order.
    pub fn flatten(&self) -> Vec<TableWrite> {
        self.batches().flat_map(WriteBatch::writes).collect()
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse a wire payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| ReplError::Decode { msg: e.to_string() })
    }
}

/// Node names recorded in the origin header, in the order they applied the message.
pub fn origin_chain(headers: &Headers) -> Vec<String> {
    headers
        .get(ORIGIN_HEADER)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Append `node` to the origin header unless it is already present.
pub fn extend_origin_chain(headers: &mut Headers, node: &str) {
    let mut chain = origin_chain(headers);
    if chain.iter().any(|n| n == node) {
        return;
    }
    chain.push(node.to_string());
    headers.insert(ORIGIN_HEADER.to_string(), chain.join(","));
}

/// Whether the message asks to bypass echo suppression.
pub fn is_replay(headers: &Headers) -> bool {
    headers
        .get(REPLAY_HEADER)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
