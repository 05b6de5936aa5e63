//! Mesh discovery.
//!
//! Every node runs two broker servers: an externally reachable mesh server
//! that routes to other nodes, and a local ingress server for clients. A
//! discovery ping on [`SERVER_PING_SUBJECT`] is answered by each server that
//! hears it; the replies are grouped per node into a graph. Peers that stay
//! silent past the timeout are simply missing from the graph.

use crate::broker::SharedBroker;
use crate::config::{NodeEndpoints, ReplicationConfig};
use crate::error::{ReplError, Result};
use crate::health::{AdminConnector, ProcessRegistry, StaticProcessRegistry, TcpAdminConnector};
use crate::subject::SERVER_PING_SUBJECT;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// Role of one broker server within a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    /// Externally reachable server that routes to other nodes.
    Mesh,
    /// Local server clients connect to.
    Ingress,
}

impl ServerRole {
    /// Both roles, mesh first.
    pub const ALL: [ServerRole; 2] = [ServerRole::Mesh, ServerRole::Ingress];

    /// Suffix appended to the node name to form the server name.
    pub fn suffix(&self) -> &'static str {
        match self {
            ServerRole::Mesh => "-mesh",
            ServerRole::Ingress => "-ingress",
        }
    }

    /// Server name for `node` in this role.
    pub fn server_name(&self, node: &str) -> String {
        format!("{}{}", node, self.suffix())
    }
}

/// Split a server name into its node name and role. Names without a role
/// suffix are mesh servers.
pub fn split_server_name(server: &str) -> (&str, ServerRole) {
    for role in ServerRole::ALL {
        if let Some(node) = server.strip_suffix(role.suffix()) {
            if !node.is_empty() {
                return (node, role);
            }
        }
    }
    (server, ServerRole::Mesh)
}

/// Identity part of a ping reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Explicit role; inferred from the name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ServerRole>,
}

/// A route from the replying server to another server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInfo {
    /// Name of the remote server.
    pub name: String,
    /// Remote endpoint, if the server reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Payload a server answers a discovery ping with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPingReply {
    /// Who is replying.
    pub server: ServerInfo,
    /// Routes to other servers. Only mesh servers report any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteInfo>,
}

impl ServerPingReply {
    /// Reply for `node`'s server in `role`.
    pub fn new(node: &str, role: ServerRole) -> Self {
        Self {
            server: ServerInfo {
                name: role.server_name(node),
                role: Some(role),
            },
            routes: Vec::new(),
        }
    }

    /// Add a route to `peer`'s mesh server.
    pub fn with_route(mut self, peer: &str, endpoint: impl Into<String>) -> Self {
        self.routes.push(RouteInfo {
            name: ServerRole::Mesh.server_name(peer),
            endpoint: Some(endpoint.into()),
        });
        self
    }

    /// Node name and role of the replying server.
    pub fn node_and_role(&self) -> (&str, ServerRole) {
        let (node, inferred) = split_server_name(&self.server.name);
        (node, self.server.role.unwrap_or(inferred))
    }
}

/// One node in the discovered graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    /// Node name.
    pub name: String,
    /// Time until the node's first reply (mesh preferred).
    pub response_time_ms: u64,
    /// Nodes this node's mesh server routes to, sorted.
    pub connected_nodes: Vec<String>,
    /// Endpoints of those routes, sorted.
    pub routes: Vec<String>,
    /// Roles that replied.
    pub roles: Vec<ServerRole>,
}

impl NodeStatus {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            response_time_ms: 0,
            connected_nodes: Vec::new(),
            routes: Vec::new(),
            roles: Vec::new(),
        }
    }

    fn merge(&mut self, reply: &ServerPingReply, role: ServerRole, elapsed_ms: u64) {
        let first_reply = self.roles.is_empty();
        if !self.roles.contains(&role) {
            self.roles.push(role);
            self.roles.sort();
        }
        if first_reply || role == ServerRole::Mesh {
            self.response_time_ms = elapsed_ms;
        }
        if role != ServerRole::Mesh {
            return;
        }
        for route in &reply.routes {
            let (peer, _) = split_server_name(&route.name);
            if peer != self.name && !self.connected_nodes.iter().any(|n| n == peer) {
                self.connected_nodes.push(peer.to_string());
            }
            if let Some(endpoint) = &route.endpoint {
                if !self.routes.contains(endpoint) {
                    self.routes.push(endpoint.clone());
                }
            }
        }
        self.connected_nodes.sort();
        self.routes.sort();
    }
}

/// Discovers the mesh and checks node health.
pub struct TopologyMonitor {
    pub(crate) broker: SharedBroker,
    pub(crate) node_name: String,
    pub(crate) admin_timeout: Duration,
    pub(crate) endpoints: BTreeMap<String, NodeEndpoints>,
    pub(crate) connector: Arc<dyn AdminConnector>,
    pub(crate) processes: Arc<dyn ProcessRegistry>,
}

impl TopologyMonitor {
    /// Monitor for the configured node. Health checks connect over TCP and
    /// assume both of this node's servers are supervised locally.
    pub fn new(config: &ReplicationConfig, broker: SharedBroker) -> Self {
        Self {
            broker,
            node_name: config.node_name.clone(),
            admin_timeout: config.admin_timeout(),
            endpoints: config
                .node_endpoints
                .keys()
                .chain(std::iter::once(&config.node_name))
                .filter_map(|node| Some((node.clone(), config.endpoints_for(node)?)))
                .collect(),
            connector: Arc::new(TcpAdminConnector),
            processes: Arc::new(StaticProcessRegistry::local(&config.node_name)),
        }
    }

    /// Replace the admin connector used by health checks.
    pub fn with_connector(mut self, connector: Arc<dyn AdminConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// Set the endpoints health checks use for `node`.
    pub fn with_node_endpoints(mut self, node: &str, endpoints: NodeEndpoints) -> Self {
        self.endpoints.insert(node.to_string(), endpoints);
        self
    }

    /// Endpoints health checks use for `node`, if known.
    pub fn endpoints(&self, node: &str) -> Option<&NodeEndpoints> {
        self.endpoints.get(node)
    }

    /// Replace the process registry used by health checks.
    pub fn with_processes(mut self, processes: Arc<dyn ProcessRegistry>) -> Self {
        self.processes = processes;
        self
    }

    /// Configured timeout for discovery and health operations.
    pub fn admin_timeout(&self) -> Duration {
        self.admin_timeout
    }

    /// Ping the mesh and collect replies until `timeout` elapses.
    ///
    /// Returns whatever answered, sorted by node name; an empty graph if
    /// nobody did.
    pub async fn list_nodes(&self, timeout: Duration) -> Result<Vec<NodeStatus>> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut replies = match self.broker.request(SERVER_PING_SUBJECT, Bytes::new()).await {
            Ok(replies) => replies,
            Err(ReplError::NoResponders { .. }) => {
                debug!(node = %self.node_name, "discovery ping had no responders");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut nodes: BTreeMap<String, NodeStatus> = BTreeMap::new();
        while let Ok(Some(delivery)) = timeout_at(deadline, replies.next()).await {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let reply: ServerPingReply = match serde_json::from_slice(&delivery.payload) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(error = %e, "ignoring malformed ping reply");
                    continue;
                }
            };
            let (node, role) = reply.node_and_role();
            nodes
                .entry(node.to_string())
                .or_insert_with(|| NodeStatus::new(node))
                .merge(&reply, role, elapsed_ms);
        }

        debug!(node = %self.node_name, discovered = nodes.len(), "discovery finished");
        Ok(nodes.into_values().collect())
    }
}

/// Answers discovery pings on behalf of one broker server.
pub struct PingResponder {
    handle: JoinHandle<()>,
}

impl PingResponder {
    /// Subscribe to discovery pings and answer each with `reply` after
    /// `delay`.
    pub async fn spawn(
        broker: SharedBroker,
        reply: ServerPingReply,
        delay: Duration,
    ) -> Result<Self> {
        let payload = Bytes::from(serde_json::to_vec(&reply)?);
        let mut pings = broker.subscribe(SERVER_PING_SUBJECT, None).await?;
        let handle = tokio::spawn(async move {
            while let Some(ping) = pings.next().await {
                let Some(reply_to) = ping.reply_to else {
                    continue;
                };
                let broker = Arc::clone(&broker);
                let payload = payload.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = broker.respond(&reply_to, payload).await {
                        warn!(error = %e, "ping reply failed");
                    }
                });
            }
        });
        Ok(Self { handle })
    }

    /// Stop answering.
    pub fn stop(self) {
        self.handle.abort();
    }
}
