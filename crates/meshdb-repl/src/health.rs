//! Per-role node health.
//!
//! Each of a node's two servers is checked on its own: a role with no local
//! process record is `Stopped`, otherwise a short-lived admin connection is
//! opened to that node's endpoint for the role and the role is `Running` if
//! it succeeds and `Errored` if it fails, times out or no endpoint is known.

use crate::error::{ReplError, Result};
use crate::topology::{ServerRole, TopologyMonitor};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::RwLock;
use tokio::net::TcpStream;
use tracing::debug;

/// Health of one server role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleStatus {
    /// Admin connection succeeded.
    Running,
    /// Admin connection failed.
    Errored,
    /// No process is recorded for the role.
    Stopped,
}

/// Health check result for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleHealth {
    /// Role checked.
    pub role: ServerRole,
    /// Endpoint that was checked, if one is known for the node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Outcome.
    pub status: RoleStatus,
    /// Connection error, when `Errored`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health of both of a node's roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeHealth {
    /// Node checked.
    pub node_name: String,
    /// Local ingress server.
    pub ingress: RoleHealth,
    /// Externally reachable mesh server.
    pub mesh: RoleHealth,
}

impl NodeHealth {
    /// True if both roles are running.
    pub fn is_fully_running(&self) -> bool {
        self.ingress.status == RoleStatus::Running && self.mesh.status == RoleStatus::Running
    }
}

/// Opens a short-lived administrative connection to a server.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    /// Connect to `endpoint` and close again.
    async fn connect(&self, endpoint: &str) -> Result<()>;
}

/// Connects over plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpAdminConnector;

#[async_trait]
impl AdminConnector for TcpAdminConnector {
    async fn connect(&self, endpoint: &str) -> Result<()> {
        let stream = TcpStream::connect(endpoint).await?;
        drop(stream);
        Ok(())
    }
}

/// Knows which server processes are supervised locally.
pub trait ProcessRegistry: Send + Sync {
    /// Whether a process is recorded for `node` in `role`.
    fn has_process(&self, node: &str, role: ServerRole) -> bool;
}

/// In-memory process records.
#[derive(Debug, Default)]
pub struct StaticProcessRegistry {
    running: RwLock<HashSet<(String, ServerRole)>>,
}

impl StaticProcessRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry recording both roles for `node`.
    pub fn local(node: &str) -> Self {
        let registry = Self::new();
        for role in ServerRole::ALL {
            registry.register(node, role);
        }
        registry
    }

    /// Record a process.
    pub fn register(&self, node: &str, role: ServerRole) {
        if let Ok(mut running) = self.running.write() {
            running.insert((node.to_string(), role));
        }
    }

    /// Forget a process.
    pub fn unregister(&self, node: &str, role: ServerRole) {
        if let Ok(mut running) = self.running.write() {
            running.remove(&(node.to_string(), role));
        }
    }
}

impl ProcessRegistry for StaticProcessRegistry {
    fn has_process(&self, node: &str, role: ServerRole) -> bool {
        self.running
            .read()
            .map(|running| running.contains(&(node.to_string(), role)))
            .unwrap_or(false)
    }
}

impl TopologyMonitor {
    /// Check both of `node_name`'s roles independently and concurrently, on
    /// that node's own endpoints.
    pub async fn check_node_health(&self, node_name: &str) -> NodeHealth {
        let endpoints = self.endpoints(node_name);
        let (ingress, mesh) = tokio::join!(
            self.check_role(node_name, ServerRole::Ingress, endpoints.map(|e| e.ingress.as_str())),
            self.check_role(node_name, ServerRole::Mesh, endpoints.map(|e| e.mesh.as_str())),
        );
        NodeHealth {
            node_name: node_name.to_string(),
            ingress,
            mesh,
        }
    }

    async fn check_role(&self, node: &str, role: ServerRole, endpoint: Option<&str>) -> RoleHealth {
        let mut health = RoleHealth {
            role,
            endpoint: endpoint.map(str::to_string),
            status: RoleStatus::Stopped,
            error: None,
        };
        if !self.processes.has_process(node, role) {
            return health;
        }
        let Some(endpoint) = endpoint else {
            debug!(node, role = ?role, "no endpoint known for role");
            health.status = RoleStatus::Errored;
            health.error = Some(format!("no {:?} endpoint known for node {}", role, node));
            return health;
        };

        let outcome = match tokio::time::timeout(self.admin_timeout, self.connector.connect(endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(ReplError::Broker {
                msg: format!("admin connection to {} timed out", endpoint),
            }),
        };
        match outcome {
            Ok(()) => health.status = RoleStatus::Running,
            Err(e) => {
                debug!(node, role = ?role, endpoint, error = %e, "role health check failed");
                health.status = RoleStatus::Errored;
                health.error = Some(e.to_string());
            }
        }
        health
    }
}
