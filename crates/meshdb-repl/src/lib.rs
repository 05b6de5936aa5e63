#![warn(missing_docs)]

//! MeshDB replication subsystem: cross-node table replication over a persistent pub/sub broker.
//!
//! Local writes are accumulated per transaction, batched into one message per
//! database and published on per-node table subjects. Each node drains its
//! inbound stream, suppresses echoes of its own writes and repeated copies of
//! one write arriving over several paths, applies the rest to local table
//! sinks under a bounded in-flight ring and relays them onward.

pub mod accumulator;
pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod inflight;
pub mod ingest;
pub mod message;
pub mod metrics;
pub mod publisher;
pub mod routes;
pub mod sink;
pub mod status;
pub mod stream_key;
pub mod subject;
pub mod topology;

pub use accumulator::{ImmediateReplicator, ReplicationTransaction};
pub use broker::{Broker, SharedBroker};
pub use config::ReplicationConfig;
pub use error::{ReplError, Result};
pub use ingest::IngestPipeline;
pub use message::{Operation, Origin, ReplicationMessage, TableWrite};
pub use publisher::Publisher;
pub use routes::ReplicationRoutes;
pub use sink::{SinkEvent, SinkRegistry, TableSink};
pub use status::StatusReport;
pub use stream_key::StreamNamer;
pub use topology::TopologyMonitor;
