//! Error types for the replication subsystem.

use thiserror::Error;

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// No stream on the broker covers the subject that was published to.
    #[error("stream not found for subject {subject}")]
    StreamNotFound {
        /// The subject that had no backing stream.
        subject: String,
    },

    /// Nobody was listening on the subject.
    #[error("no responders on subject {subject}")]
    NoResponders {
        /// The subject that had no responders.
        subject: String,
    },

    /// One or more per-database publishes failed after commit.
    ///
    /// The local write is not rolled back; replication of it is lost unless
    /// the caller retries.
    #[error("replication unavailable for {} database(s): {}", failures.len(), summarize(failures))]
    ReplicationUnavailable {
        /// `(database, reason)` for every publish that failed.
        failures: Vec<(String, String)>,
    },

    /// Inbound message for a table nobody registered a sink for.
    #[error("no sink registered for {database}.{table}")]
    UnknownSink {
        /// Database of the inbound message.
        database: String,
        /// Table of the inbound message.
        table: String,
    },

    /// The local sink rejected a replicated write.
    #[error("sink apply failed for {database}.{table}: {msg}")]
    ApplyFailure {
        /// Database of the write.
        database: String,
        /// Table of the write.
        table: String,
        /// Error message from the sink.
        msg: String,
    },

    /// Payload or header could not be decoded.
    #[error("decode error: {msg}")]
    Decode {
        /// Error message describing the issue.
        msg: String,
    },

    /// Broker-side failure other than a missing stream.
    #[error("broker error: {msg}")]
    Broker {
        /// Error message describing the broker issue.
        msg: String,
    },

    /// Write added to a transaction that has already been committed.
    #[error("transaction already committed")]
    TransactionClosed,

    /// Invalid or unreadable configuration.
    #[error("config error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML config parse error.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The broker connection or pipeline was shut down.
    #[error("replication shut down")]
    Shutdown,
}

impl ReplError {
    /// Returns true for gateway-timeout class errors a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ReplicationUnavailable { .. } | Self::NoResponders { .. } | Self::Broker { .. }
        )
    }

    /// Returns true if the broker reported that the target stream is missing.
    pub fn is_missing_stream(&self) -> bool {
        matches!(self, Self::StreamNotFound { .. } | Self::NoResponders { .. })
    }
}

fn summarize(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(db, reason)| format!("{}: {}", db, reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias for the replication subsystem.
pub type Result<T> = std::result::Result<T, ReplError>;
