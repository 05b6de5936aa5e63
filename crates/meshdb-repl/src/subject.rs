//! Subject and stream naming for replication traffic.

use crate::error::{ReplError, Result};

/// Subject on which broker servers answer discovery pings.
pub const SERVER_PING_SUBJECT: &str = "$SYS.REQ.SERVER.PING";

/// Builds every subject and name a node uses on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectScheme {
    prefix: String,
}

impl SubjectScheme {
    /// Create a scheme rooted at `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// The subject prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Per-node subject a node publishes its own writes on:
    /// `<prefix>.<database>.<table>.<node>`.
    pub fn table_subject(&self, database: &str, table: &str, node: &str) -> String {
        format!("{}.{}.{}.{}", self.prefix, database, table, node)
    }

    /// Canonical (not node-suffixed) table subject used for relays.
    pub fn canonical_subject(&self, database: &str, table: &str) -> String {
        format!("{}.{}.{}", self.prefix, database, table)
    }

    /// Node-scoped inbound subject; anything published here lands in the
    /// node's inbound stream.
    pub fn inbound_subject(&self, node: &str) -> String {
        format!("{}.inbound.{}", self.prefix, node)
    }

    /// Name of the node's inbound stream.
    pub fn inbound_stream(&self, node: &str) -> String {
        format!("{}_inbound_{}", self.prefix, node)
    }

    /// Durable consumer name for the node's ingest pipeline. Also used as the
    /// queue group so that several processes of one node share the work.
    pub fn ingest_durable(&self, node: &str) -> String {
        format!("{}_ingest_{}", self.prefix, node)
    }
}

/// Reject names that would change a subject's shape: empty values, the `.`
/// separator, the `*` and `>` wildcards, and whitespace.
pub fn validate_token(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ReplError::Config {
            msg: format!("{} must not be empty", field),
        });
    }
    if value
        .chars()
        .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
    {
        return Err(ReplError::Config {
            msg: format!("{} contains a subject separator or wildcard: {:?}", field, value),
        });
    }
    Ok(())
}

/// Returns true if `subject` matches `pattern` with NATS wildcards:
/// `*` matches exactly one token, a trailing `>` matches one or more.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
