//! Replication configuration.

use crate::error::{ReplError, Result};
use crate::subject::validate_token;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// How finely tables are mapped onto broker streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamGranularity {
    /// One stream per (database, table).
    #[default]
    Table,
    /// One stream per database; all its tables share it.
    Database,
}

/// How peer table streams reach this node's inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    /// Inbound stream subscribes to peer table subjects directly.
    #[default]
    Direct,
    /// Table streams are sourced into the inbound stream.
    SourceComposition,
}

/// Admin endpoints of one node's two servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEndpoints {
    /// Local ingress server.
    pub ingress: String,
    /// Externally reachable mesh server.
    pub mesh: String,
}

/// Configuration for one replicating node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// This node's name; stamped into every origin.
    pub node_name: String,
    /// First token of every replication subject.
    pub subject_prefix: String,
    /// Stream granularity used by the stream namer.
    pub granularity: StreamGranularity,
    /// Maximum number of concurrently unresolved sink applies.
    pub max_inflight: usize,
    /// How many recently applied origins the ingest pipeline remembers to
    /// drop further copies of the same message.
    pub dedup_window: usize,
    /// Timeout for discovery and health operations (ms).
    pub admin_timeout_ms: u64,
    /// Route strategy for inbound table streams.
    pub route_strategy: RouteStrategy,
    /// Endpoint of this node's local ingress server.
    pub ingress_endpoint: String,
    /// Endpoint of this node's externally reachable mesh server.
    pub mesh_endpoint: String,
    /// Server endpoints of other nodes, for health checks. An entry for this
    /// node is ignored in favour of `ingress_endpoint` and `mesh_endpoint`.
    pub node_endpoints: BTreeMap<String, NodeEndpoints>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            node_name: "node-1".to_string(),
            subject_prefix: "txn".to_string(),
            granularity: StreamGranularity::Table,
            max_inflight: 100,
            dedup_window: 10_000,
            admin_timeout_ms: 2000,
            route_strategy: RouteStrategy::Direct,
            ingress_endpoint: "127.0.0.1:9933".to_string(),
            mesh_endpoint: "0.0.0.0:9932".to_string(),
            node_endpoints: BTreeMap::new(),
        }
    }
}

impl ReplicationConfig {
    /// Create a default config for the named node.
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Default::default()
        }
    }

    /// Load a config from a `.toml` or `.json` file and validate it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ReplicationConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(ReplError::Config {
                    msg: format!("unsupported config file extension: {:?}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that names are usable as subject tokens and limits are sane.
    pub fn validate(&self) -> Result<()> {
        validate_token("node_name", &self.node_name)?;
        validate_token("subject_prefix", &self.subject_prefix)?;
        if self.max_inflight == 0 {
            return Err(ReplError::Config {
                msg: "max_inflight must be at least 1".to_string(),
            });
        }
        for node in self.node_endpoints.keys() {
            validate_token("node_endpoints", node)?;
        }
        if self.dedup_window == 0 {
            return Err(ReplError::Config {
                msg: "dedup_window must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Endpoints to health-check `node` on, if known.
    pub fn endpoints_for(&self, node: &str) -> Option<NodeEndpoints> {
        if node == self.node_name {
            return Some(NodeEndpoints {
                ingress: self.ingress_endpoint.clone(),
                mesh: self.mesh_endpoint.clone(),
            });
        }
        self.node_endpoints.get(node).cloned()
    }

    /// Admin timeout as a `Duration`.
    pub fn admin_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.admin_timeout_ms)
    }
}
