#![warn(missing_docs)]

//! `mesh-repl`: inspect replication naming and configuration, or run a
//! simulated mesh on the in-memory broker.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshdb_repl::accumulator::CommitInfo;
use meshdb_repl::broker::memory::MemoryBroker;
use meshdb_repl::config::StreamGranularity;
use meshdb_repl::sink::ChannelSink;
use meshdb_repl::stream_key::compute_stream_key;
use meshdb_repl::{
    metrics, IngestPipeline, Publisher, ReplicationConfig, ReplicationRoutes,
    ReplicationTransaction, SharedBroker, SinkRegistry, TableWrite,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "mesh-repl", about = "MeshDB replication tools", version)]
struct Cli {
    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the stream key for a database and table
    StreamKey {
        /// Database name
        database: String,
        /// Table name
        table: String,
        /// Use one stream per database instead of per table
        #[arg(long)]
        database_level: bool,
    },
    /// Load and validate a config file, then print it as JSON
    Config {
        /// Path to a .toml or .json file
        path: PathBuf,
    },
    /// Run a three-node mesh in memory and commit one transaction on the first node
    Simulate {
        /// Node names
        #[arg(long, value_delimiter = ',', default_value = "node-1,node-2,node-3")]
        nodes: Vec<String>,
        /// How long to let replication settle (ms)
        #[arg(long, default_value_t = 200)]
        settle_ms: u64,
        /// Print Prometheus metrics for every node afterwards
        #[arg(long)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    match cli.command {
        Command::StreamKey {
            database,
            table,
            database_level,
        } => {
            let granularity = if database_level {
                StreamGranularity::Database
            } else {
                StreamGranularity::Table
            };
            println!("{}", compute_stream_key(granularity, &database, &table));
            Ok(())
        }
        Command::Config { path } => {
            let config = ReplicationConfig::from_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Simulate {
            nodes,
            settle_ms,
            metrics,
        } => simulate(nodes, Duration::from_millis(settle_ms), metrics).await,
    }
}

struct SimNode {
    config: ReplicationConfig,
    publisher: Arc<Publisher>,
    pipeline: Arc<IngestPipeline>,
}

async fn simulate(names: Vec<String>, settle: Duration, print_metrics: bool) -> Result<()> {
    anyhow::ensure!(names.len() >= 2, "need at least two nodes");
    let broker = MemoryBroker::new();
    let shared: SharedBroker = Arc::new(broker.clone());
    let tables = ["orders", "items"];

    let mut nodes = Vec::new();
    let mut handles = Vec::new();
    for name in &names {
        let config = ReplicationConfig::new(name.clone());
        config.validate()?;
        let publisher = Arc::new(Publisher::new(&config, Arc::clone(&shared)));
        let registry = Arc::new(SinkRegistry::new());

        let routes = ReplicationRoutes::new(&publisher, config.route_strategy);
        let peers: Vec<String> = names.iter().filter(|n| *n != name).cloned().collect();
        for table in tables {
            routes.connect("dev", table, &peers).await?;
            let (sink, mut applied) = ChannelSink::new();
            registry.set_subscription("dev", table, Arc::new(sink));
            let node = name.clone();
            tokio::spawn(async move {
                while let Some(event) = applied.recv().await {
                    let writes: Vec<String> = event
                        .writes()
                        .iter()
                        .map(|w| format!("{}:{}", w.table, w.id))
                        .collect();
                    tracing::info!(
                        node = %node,
                        table = %event.table,
                        operation = ?event.operation(),
                        origin = %event.origin.node_name,
                        writes = ?writes,
                        "applied replicated event"
                    );
                    event.commit();
                }
            });
        }

        let pipeline = Arc::new(IngestPipeline::new(
            &config,
            Arc::clone(&publisher),
            registry,
        ));
        handles.push(pipeline.start().await?);
        nodes.push(SimNode {
            config,
            publisher,
            pipeline,
        });
    }

    let first = &nodes[0];
    let mut txn = ReplicationTransaction::new(Arc::clone(&first.publisher));
    txn.add_write("dev", TableWrite::put("orders", 1, json!({"id": 1, "item": 9})))?;
    txn.add_write("dev", TableWrite::put("items", 9, json!({"id": 9, "sku": "widget"})))?;
    let summary = txn.commit(CommitInfo::default()).await?;
    tracing::info!(node = %first.config.node_name, writes = summary.writes, "transaction committed");

    tokio::time::sleep(settle).await;

    for node in &nodes {
        node.pipeline.abort_handle().abort();
    }
    for handle in handles {
        handle.await??;
    }

    for node in &nodes {
        let stats = node.pipeline.stats();
        tracing::info!(
            node = %node.config.node_name,
            received = stats.received,
            applied = stats.applied,
            echoes = stats.echoes_suppressed,
            duplicates = stats.duplicates_suppressed,
            relayed = stats.relayed,
            "node finished"
        );
        if print_metrics {
            print!(
                "{}",
                metrics::render(
                    &node.publisher.stats(),
                    &stats,
                    &node.config.node_name
                )
            );
        }
    }
    Ok(())
}
