//! Common test utilities: an in-process mesh of replicating nodes sharing one
//! in-memory broker.

#![allow(dead_code)]

use meshdb_repl::broker::memory::MemoryBroker;
use meshdb_repl::config::RouteStrategy;
use meshdb_repl::ingest::PipelineStats;
use meshdb_repl::sink::ChannelSink;
use meshdb_repl::{
    IngestPipeline, Publisher, ReplicationConfig, ReplicationRoutes, SharedBroker, SinkEvent,
    SinkRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Tables every test node replicates.
pub const TABLES: [&str; 2] = ["orders", "items"];

/// One replicating node in an in-process mesh
pub struct TestNode {
    pub config: ReplicationConfig,
    pub publisher: Arc<Publisher>,
    pub pipeline: Arc<IngestPipeline>,
    pub routes: ReplicationRoutes,
    pub orders: mpsc::UnboundedReceiver<SinkEvent>,
    pub items: mpsc::UnboundedReceiver<SinkEvent>,
    handle: Option<JoinHandle<meshdb_repl::Result<()>>>,
}

impl TestNode {
    pub fn name(&self) -> &str {
        &self.config.node_name
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Stop pulling and wait for the pipeline to drain.
    pub async fn shutdown(&mut self) {
        self.pipeline.abort_handle().abort();
        if let Some(handle) = self.handle.take() {
            timeout(Duration::from_secs(2), handle)
                .await
                .expect("pipeline did not stop")
                .expect("pipeline task panicked")
                .expect("pipeline failed");
        }
    }
}

/// A mesh where every node receives every table from every other node
pub struct TestMesh {
    pub broker: MemoryBroker,
    pub nodes: Vec<TestNode>,
}

impl TestMesh {
    pub async fn new(names: &[&str]) -> Self {
        Self::with_strategy(names, RouteStrategy::Direct).await
    }

    pub async fn with_strategy(names: &[&str], strategy: RouteStrategy) -> Self {
        let broker = MemoryBroker::new();
        let shared: SharedBroker = Arc::new(broker.clone());
        let mut nodes = Vec::new();

        for name in names {
            let config = ReplicationConfig {
                route_strategy: strategy,
                ..ReplicationConfig::new(*name)
            };
            let publisher = Arc::new(Publisher::new(&config, Arc::clone(&shared)));
            let registry = Arc::new(SinkRegistry::new());
            let routes = ReplicationRoutes::new(&publisher, strategy);
            let peers: Vec<String> = names
                .iter()
                .filter(|n| *n != name)
                .map(|n| n.to_string())
                .collect();

            let mut receivers = Vec::new();
            for table in TABLES {
                routes.connect("dev", table, &peers).await.unwrap();
                let (sink, rx) = ChannelSink::new();
                registry.set_subscription("dev", table, Arc::new(sink));
                receivers.push(rx);
            }
            let items = receivers.pop().unwrap();
            let orders = receivers.pop().unwrap();

            let pipeline = Arc::new(IngestPipeline::new(&config, Arc::clone(&publisher), registry));
            let handle = pipeline.start().await.unwrap();
            nodes.push(TestNode {
                config,
                publisher,
                pipeline,
                routes,
                orders,
                items,
                handle: Some(handle),
            });
        }
        Self { broker, nodes }
    }

    pub fn node(&mut self, name: &str) -> &mut TestNode {
        self.nodes
            .iter_mut()
            .find(|n| n.config.node_name == name)
            .expect("unknown node")
    }

    pub async fn shutdown(&mut self) {
        for node in &mut self.nodes {
            node.shutdown().await;
        }
    }

    /// Wait until no node receives anything new for a while.
    pub async fn settle(&self) {
        let mut last: Vec<u64> = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let now: Vec<u64> = self.nodes.iter().map(|n| n.stats().received).collect();
            if now == last {
                return;
            }
            last = now;
        }
        panic!("mesh did not settle");
    }
}

/// Next sink event, failing the test if none arrives in time.
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> SinkEvent {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no sink event within 1s")
        .expect("sink channel closed")
}

/// Drain every event already delivered.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> Vec<SinkEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
