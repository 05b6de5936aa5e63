//! Prometheus text exposition of replication counters.

use crate::ingest::PipelineStats;
use crate::publisher::PublisherStats;

/// Prometheus metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Point-in-time value.
    Gauge,
}

impl MetricKind {
    fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// One labelled sample with its help text.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Metric name, e.g. `meshdb_repl_published_total`.
    pub name: String,
    /// Help text.
    pub help: String,
    /// Counter or gauge.
    pub kind: MetricKind,
    /// Label pairs.
    pub labels: Vec<(String, String)>,
    /// Current value.
    pub value: u64,
}

impl Metric {
    /// A counter sample.
    pub fn counter(name: &str, help: &str, labels: Vec<(String, String)>, value: u64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            kind: MetricKind::Counter,
            labels,
            value,
        }
    }

    /// A gauge sample.
    pub fn gauge(name: &str, help: &str, labels: Vec<(String, String)>, value: u64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            kind: MetricKind::Gauge,
            labels,
            value,
        }
    }

    /// Format as `# HELP`, `# TYPE` and sample lines.
    pub fn format(&self) -> String {
        let mut output = format!("# HELP {} {}\n", self.name, self.help);
        output.push_str(&format!("# TYPE {} {}\n", self.name, self.kind.as_str()));

        if self.labels.is_empty() {
            output.push_str(&format!("{} {}\n", self.name, self.value));
        } else {
            let labels = self
                .labels
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
                .collect::<Vec<_>>()
                .join(",");
            output.push_str(&format!("{}{{{}}} {}\n", self.name, labels, self.value));
        }
        output
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Every publisher and pipeline counter for `node`.
pub fn collect(publisher: &PublisherStats, pipeline: &PipelineStats, node: &str) -> Vec<Metric> {
    let labels = || vec![("node".to_string(), node.to_string())];
    let counter = |name: &str, help: &str, value: u64| {
        Metric::counter(&format!("meshdb_repl_{}", name), help, labels(), value)
    };

    vec![
        counter("published_total", "Messages published on this node's table subjects", publisher.published),
        counter("streams_created_total", "Streams created on first publish", publisher.streams_created),
        counter("publish_failures_total", "Publishes that failed after stream creation", publisher.failures),
        counter("flushes_total", "Broker flushes performed", publisher.flushes),
        counter("received_total", "Inbound messages received", pipeline.received),
        counter("echoes_suppressed_total", "Inbound echoes of own writes dropped", pipeline.echoes_suppressed),
        counter("duplicates_suppressed_total", "Inbound copies of already applied messages dropped", pipeline.duplicates_suppressed),
        counter("dispatched_total", "Events dispatched to sinks", pipeline.dispatched),
        counter("applied_total", "Events committed by sinks", pipeline.applied),
        counter("unknown_sink_total", "Inbound messages for unregistered tables", pipeline.unknown_sink),
        counter("decode_failures_total", "Inbound messages that failed to decode", pipeline.decode_failures),
        counter("apply_failures_total", "Sink applies that failed", pipeline.apply_failures),
        counter("relayed_total", "Inbound messages relayed onward", pipeline.relayed),
        counter("relay_failures_total", "Relays that failed", pipeline.relay_failures),
        counter("acked_total", "Inbound messages acknowledged", pipeline.acked),
        Metric::gauge(
            "meshdb_repl_last_applied_timestamp_us",
            "Origin timestamp of the newest committed apply",
            labels(),
            pipeline.last_applied_timestamp,
        ),
    ]
}

/// Render all counters for `node` as Prometheus text.
pub fn render(publisher: &PublisherStats, pipeline: &PipelineStats, node: &str) -> String {
    collect(publisher, pipeline, node)
        .iter()
        .map(Metric::format)
        .collect()
}
