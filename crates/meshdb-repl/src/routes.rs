//! Replication routes: which peer table traffic reaches this node's inbound
//! stream, and how.

use crate::broker::SharedBroker;
use crate::config::RouteStrategy;
use crate::error::Result;
use crate::publisher::Publisher;
use crate::stream_key::StreamNamer;
use crate::subject::{validate_token, SubjectScheme};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// One replicated table and the peers it is received from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationConnection {
    /// Database name.
    pub database: String,
    /// Table name.
    pub table: String,
    /// Peer nodes whose writes to the table are received, sorted.
    pub peers: Vec<String>,
    /// How the table reaches the inbound stream.
    pub strategy: RouteStrategy,
}

/// Maintains this node's replication connections.
pub struct ReplicationRoutes {
    broker: SharedBroker,
    namer: Arc<StreamNamer>,
    subjects: SubjectScheme,
    node_name: String,
    strategy: RouteStrategy,
    connections: RwLock<BTreeMap<(String, String), ReplicationConnection>>,
}

impl ReplicationRoutes {
    /// Routes for the publisher's node using `strategy`.
    pub fn new(publisher: &Publisher, strategy: RouteStrategy) -> Self {
        Self {
            broker: Arc::clone(publisher.broker()),
            namer: Arc::clone(publisher.namer()),
            subjects: publisher.subjects().clone(),
            node_name: publisher.node_name().to_string(),
            strategy,
            connections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Strategy in use.
    pub fn strategy(&self) -> RouteStrategy {
        self.strategy
    }

    /// Start receiving `database.table` writes from `peers`, plus anything
    /// relayed on the table's canonical subject. Connecting again adds peers.
    pub async fn connect(&self, database: &str, table: &str, peers: &[String]) -> Result<()> {
        validate_token("database", database)?;
        validate_token("table", table)?;
        let peers: Vec<String> = peers
            .iter()
            .filter(|p| **p != self.node_name)
            .cloned()
            .collect();
        for peer in &peers {
            validate_token("peer", peer)?;
        }

        let inbound = self.subjects.inbound_stream(&self.node_name);
        let canonical = self.subjects.canonical_subject(database, table);
        let peer_subjects: Vec<String> = peers
            .iter()
            .map(|peer| self.subjects.table_subject(database, table, peer))
            .collect();

        match self.strategy {
            RouteStrategy::Direct => {
                let mut subjects = vec![self.subjects.inbound_subject(&self.node_name)];
                subjects.extend(peer_subjects);
                subjects.push(canonical);
                self.broker.create_stream(&inbound, &subjects).await?;
            }
            RouteStrategy::SourceComposition => {
                let key = self.namer.derive_stream_key(database, table);
                self.broker
                    .create_stream(key.as_str(), &[canonical.clone()])
                    .await?;
                self.broker
                    .create_stream(&inbound, &[self.subjects.inbound_subject(&self.node_name)])
                    .await?;
                for filter in peer_subjects.iter().chain(std::iter::once(&canonical)) {
                    self.broker
                        .add_stream_source(&inbound, key.as_str(), Some(filter.as_str()))
                        .await?;
                }
            }
        }

        let mut connections = self.connections.write().await;
        let entry = connections
            .entry((database.to_string(), table.to_string()))
            .or_insert_with(|| ReplicationConnection {
                database: database.to_string(),
                table: table.to_string(),
                peers: Vec::new(),
                strategy: self.strategy,
            });
        for peer in peers {
            if !entry.peers.contains(&peer) {
                entry.peers.push(peer);
            }
        }
        entry.peers.sort();
        info!(
            node = %self.node_name,
            database,
            table,
            peers = ?entry.peers,
            strategy = ?self.strategy,
            "replication route connected"
        );
        Ok(())
    }

    /// Current connections, ordered by database and table.
    pub async fn connections(&self) -> Vec<ReplicationConnection> {
        self.connections.read().await.values().cloned().collect()
    }
}
