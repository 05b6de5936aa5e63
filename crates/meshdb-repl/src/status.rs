//! Operational status data: node health, the discovered mesh and the
//! replication connection list, gathered in one serializable report.

use crate::config::{ReplicationConfig, RouteStrategy, StreamGranularity};
use crate::error::Result;
use crate::health::NodeHealth;
use crate::routes::{ReplicationConnection, ReplicationRoutes};
use crate::topology::{NodeStatus, TopologyMonitor};
use serde::Serialize;

/// Everything a status command reports for one node.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Node the report is for.
    pub node_name: String,
    /// Stream granularity in use.
    pub granularity: StreamGranularity,
    /// Route strategy in use.
    pub route_strategy: RouteStrategy,
    /// Per-role health of this node.
    pub health: NodeHealth,
    /// Nodes that answered discovery.
    pub nodes: Vec<NodeStatus>,
    /// Replicated tables and their peers.
    pub connections: Vec<ReplicationConnection>,
}

impl StatusReport {
    /// Check health and discover the mesh concurrently, then add the
    /// connection list.
    pub async fn collect(
        monitor: &TopologyMonitor,
        routes: &ReplicationRoutes,
        config: &ReplicationConfig,
    ) -> Result<Self> {
        let (health, nodes) = tokio::join!(
            monitor.check_node_health(&config.node_name),
            monitor.list_nodes(monitor.admin_timeout()),
        );
        Ok(Self {
            node_name: config.node_name.clone(),
            granularity: config.granularity,
            route_strategy: routes.strategy(),
            health,
            nodes: nodes?,
            connections: routes.connections().await,
        })
    }
}
