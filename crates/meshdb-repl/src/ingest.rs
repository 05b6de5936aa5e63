//! Ingest pipeline: drains a node's inbound stream and applies replicated
//! writes to local sinks.
//!
//! Per delivery: decode, drop echoes of this node's own writes, wait for an
//! in-flight slot, drop copies of a message already dispatched, dispatch to
//! the table's sink without waiting for it, acknowledge, then relay the
//! original bytes on the table's canonical subject. Failures are logged and contained to the one message; every
//! message is acknowledged, so nothing is redelivered.
//!
//! In a mesh where nodes both receive peers' subjects directly and relay
//! onto canonical subjects, one write reaches a node once per path. Copies
//! are recognised by origin node, origin timestamp and database, which a
//! publisher never reuses.
//!
//! Acking before the sink resolves trades durability for throughput: a crash
//! between ack and local commit loses that write on this node.

use crate::broker::{ConsumerOptions, Delivery, Headers, Subscription};
use crate::config::ReplicationConfig;
use crate::error::{ReplError, Result};
use crate::inflight::InflightRing;
use crate::message::{is_replay, origin_chain, Origin, ReplicationMessage};
use crate::publisher::Publisher;
use crate::sink::{OnCommit, SinkEvent, SinkRegistry};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ingest pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Not yet consuming.
    Idle,
    /// Pulling and dispatching messages.
    Running,
    /// No longer pulling; waiting for dispatched applies to finish.
    Draining,
    /// Completely stopped.
    Stopped,
}

#[derive(Debug, Default)]
struct PipelineStatsInner {
    received: AtomicU64,
    echoes_suppressed: AtomicU64,
    duplicates_suppressed: AtomicU64,
    dispatched: AtomicU64,
    applied: AtomicU64,
    unknown_sink: AtomicU64,
    decode_failures: AtomicU64,
    apply_failures: AtomicU64,
    relayed: AtomicU64,
    relay_failures: AtomicU64,
    acked: AtomicU64,
    last_applied_timestamp: AtomicU64,
}

/// Snapshot of ingest counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Deliveries pulled from the broker.
    pub received: u64,
    /// Deliveries dropped as echoes of this node's writes.
    pub echoes_suppressed: u64,
    /// Deliveries dropped as further copies of an already dispatched message.
    pub duplicates_suppressed: u64,
    /// Events handed to sinks.
    pub dispatched: u64,
    /// Events whose sinks reported a local commit.
    pub applied: u64,
    /// Deliveries dropped for lack of a registered sink.
    pub unknown_sink: u64,
    /// Deliveries that could not be decoded.
    pub decode_failures: u64,
    /// Sink applies that failed.
    pub apply_failures: u64,
    /// Messages relayed onward.
    pub relayed: u64,
    /// Relays that failed.
    pub relay_failures: u64,
    /// Deliveries acknowledged.
    pub acked: u64,
    /// Highest origin timestamp among committed applies.
    pub last_applied_timestamp: u64,
}

/// Stops a running pipeline from pulling more messages. Already dispatched
/// applies are left to finish.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Request the pipeline to stop pulling.
    pub fn abort(&self) {
        self.sender.send_replace(true);
    }

    /// Whether abort has been requested.
    pub fn is_aborted(&self) -> bool {
        *self.sender.borrow()
    }
}

type SeenKey = (String, u64, String);

/// Bounded memory of recently dispatched origins; the oldest entry is
/// forgotten first.
#[derive(Debug)]
struct SeenWindow {
    capacity: usize,
    order: VecDeque<SeenKey>,
    keys: HashSet<SeenKey>,
}

impl SeenWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            keys: HashSet::with_capacity(capacity),
        }
    }

    /// Record `key`; false if it is already remembered.
    fn insert(&mut self, key: SeenKey) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }
}

/// The per-node ingest pipeline.
pub struct IngestPipeline {
    config: ReplicationConfig,
    publisher: Arc<Publisher>,
    registry: Arc<SinkRegistry>,
    ring: InflightRing,
    stats: Arc<PipelineStatsInner>,
    seen: Mutex<SeenWindow>,
    state: Mutex<PipelineState>,
    abort: AbortHandle,
    relay: bool,
}

impl IngestPipeline {
    /// Create a pipeline for the configured node.
    pub fn new(
        config: &ReplicationConfig,
        publisher: Arc<Publisher>,
        registry: Arc<SinkRegistry>,
    ) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            config: config.clone(),
            publisher,
            registry,
            ring: InflightRing::new(config.max_inflight),
            stats: Arc::new(PipelineStatsInner::default()),
            seen: Mutex::new(SeenWindow::new(config.dedup_window)),
            state: Mutex::new(PipelineState::Idle),
            abort: AbortHandle {
                sender: Arc::new(sender),
            },
            relay: true,
        }
    }

    /// Disable relaying (leaf nodes that nobody sources from).
    pub fn without_relay(mut self) -> Self {
        self.relay = false;
        self
    }

    /// Handle used to stop pulling.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Current state.
    pub async fn state(&self) -> PipelineState {
        *self.state.lock().await
    }

    /// Ring bounding concurrent sink applies.
    pub fn inflight(&self) -> &InflightRing {
        &self.ring
    }

    /// Ensure the node's inbound stream exists and join its durable,
    /// queue-grouped consumer.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let subjects = self.publisher.subjects();
        let node = &self.config.node_name;
        let stream = subjects.inbound_stream(node);
        let durable = subjects.ingest_durable(node);

        let broker = self.publisher.broker();
        broker
            .create_stream(&stream, &[subjects.inbound_subject(node)])
            .await?;
        broker
            .open_durable_consumer(
                &stream,
                ConsumerOptions::durable(durable.clone()).with_queue_group(durable),
            )
            .await
    }

    /// Subscribe and run the pipeline on a background task.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        let subscription = self.subscribe().await?;
        let pipeline = Arc::clone(self);
        Ok(tokio::spawn(async move { pipeline.run(subscription).await }))
    }

    /// Drain `subscription` until it closes or abort is requested, then wait
    /// for dispatched applies to finish.
    pub async fn run(&self, mut subscription: Subscription) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != PipelineState::Idle {
                return Err(ReplError::Shutdown);
            }
            *state = PipelineState::Running;
        }
        info!(node = %self.config.node_name, inbound = subscription.subject(), "ingest pipeline started");

        let mut abort = self.abort.sender.subscribe();
        loop {
            if *abort.borrow_and_update() {
                break;
            }
            tokio::select! {
                biased;
                changed = abort.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = subscription.next() => match next {
                    Some(delivery) => self.handle_delivery(delivery).await,
                    None => break,
                },
            }
        }

        *self.state.lock().await = PipelineState::Draining;
        self.ring.drain().await?;
        *self.state.lock().await = PipelineState::Stopped;
        info!(node = %self.config.node_name, "ingest pipeline stopped");
        Ok(())
    }

    /// Process one delivery. Never fails; problems are logged and counted.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let message = match ReplicationMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(subject = %delivery.subject, error = %e, "dropping undecodable message");
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                self.ack(&delivery).await;
                return;
            }
        };

        if self.is_echo(&message, &delivery.headers) {
            debug!(
                database = %message.database,
                table = message.table(),
                "suppressing echo of own write"
            );
            self.stats.echoes_suppressed.fetch_add(1, Ordering::Relaxed);
            self.ack(&delivery).await;
            return;
        }
        self.publisher.clock().witness(message.origin.timestamp);

        let permit = match self.ring.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                warn!(error = %e, "in-flight ring closed");
                self.ack(&delivery).await;
                return;
            }
        };

        let sink = match self.registry.get(&message.database, message.table()) {
            Ok(sink) => sink,
            Err(e) => {
                warn!(error = %e, "dropping message for unregistered table");
                self.stats.unknown_sink.fetch_add(1, Ordering::Relaxed);
                drop(permit);
                self.ack(&delivery).await;
                return;
            }
        };

        if self.is_duplicate(&message, &delivery.headers).await {
            debug!(
                database = %message.database,
                table = message.table(),
                origin = %message.origin.node_name,
                timestamp = message.origin.timestamp,
                "suppressing repeated delivery"
            );
            self.stats.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
            drop(permit);
            self.ack(&delivery).await;
            return;
        }

        let event = SinkEvent::from_message(&message, Some(self.on_commit()));
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::clone(&self.stats);
        let (database, table) = (message.database.clone(), message.table().to_string());
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = sink.send(event).await {
                warn!(database = %database, table = %table, error = %e, "sink apply failed");
                stats.apply_failures.fetch_add(1, Ordering::Relaxed);
            }
        });

        self.ack(&delivery).await;

        if self.relay {
            self.relay(&message, delivery.payload, delivery.headers).await;
        }
    }

    /// Snapshot of pipeline counters.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            received: self.stats.received.load(Ordering::Relaxed),
            echoes_suppressed: self.stats.echoes_suppressed.load(Ordering::Relaxed),
            duplicates_suppressed: self.stats.duplicates_suppressed.load(Ordering::Relaxed),
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            applied: self.stats.applied.load(Ordering::Relaxed),
            unknown_sink: self.stats.unknown_sink.load(Ordering::Relaxed),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
            apply_failures: self.stats.apply_failures.load(Ordering::Relaxed),
            relayed: self.stats.relayed.load(Ordering::Relaxed),
            relay_failures: self.stats.relay_failures.load(Ordering::Relaxed),
            acked: self.stats.acked.load(Ordering::Relaxed),
            last_applied_timestamp: self.stats.last_applied_timestamp.load(Ordering::Relaxed),
        }
    }

    fn is_echo(&self, message: &ReplicationMessage, headers: &Headers) -> bool {
        if is_replay(headers) {
            return false;
        }
        let node = &self.config.node_name;
        message.origin.node_name == *node || origin_chain(headers).iter().any(|n| n == node)
    }

    /// Whether an identical message was already dispatched. Replays are
    /// always applied again.
    async fn is_duplicate(&self, message: &ReplicationMessage, headers: &Headers) -> bool {
        if is_replay(headers) {
            return false;
        }
        let key = (
            message.origin.node_name.clone(),
            message.origin.timestamp,
            message.database.clone(),
        );
        !self.seen.lock().await.insert(key)
    }

    fn on_commit(&self) -> OnCommit {
        let stats = Arc::clone(&self.stats);
        Arc::new(move |origin: &Origin| {
            stats.applied.fetch_add(1, Ordering::Relaxed);
            stats
                .last_applied_timestamp
                .fetch_max(origin.timestamp, Ordering::Relaxed);
        })
    }

    async fn ack(&self, delivery: &Delivery) {
        match delivery.ack().await {
            Ok(()) => {
                self.stats.acked.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(subject = %delivery.subject, error = %e, "ack failed"),
        }
    }

    async fn relay(&self, message: &ReplicationMessage, payload: bytes::Bytes, headers: Headers) {
        match self
            .publisher
            .relay(&message.database, message.table(), payload, headers)
            .await
        {
            Ok(()) => {
                self.stats.relayed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(
                    database = %message.database,
                    table = message.table(),
                    error = %e,
                    "relay failed"
                );
                self.stats.relay_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{Acker, Broker};
    use crate::message::{TableWrite, WriteBatch, ORIGIN_HEADER, REPLAY_HEADER};
    use crate::sink::{ChannelSink, SinkPayload, TableSink};
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::{mpsc, Notify};
    use tokio::time::{sleep, timeout};

    struct CountingAck(Arc<AtomicUsize>);

    #[async_trait]
    impl Acker for CountingAck {
        async fn ack(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Sink that records events and only resolves once released.
    struct GatedSink {
        seen: mpsc::UnboundedSender<SinkEvent>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl TableSink for GatedSink {
        async fn send(&self, event: SinkEvent) -> Result<()> {
            let _ = self.seen.send(event);
            self.gate.notified().await;
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl TableSink for FailingSink {
        async fn send(&self, event: SinkEvent) -> Result<()> {
            Err(ReplError::ApplyFailure {
                database: event.database,
                table: event.table,
                msg: "disk full".to_string(),
            })
        }
    }

    struct Harness {
        broker: MemoryBroker,
        publisher: Arc<Publisher>,
        registry: Arc<SinkRegistry>,
        pipeline: Arc<IngestPipeline>,
        acks: Arc<AtomicUsize>,
    }

    fn harness_with(max_inflight: usize) -> Harness {
        let config = ReplicationConfig {
            max_inflight,
            ..ReplicationConfig::new("west")
        };
        let broker = MemoryBroker::new();
        let publisher = Arc::new(Publisher::new(&config, Arc::new(broker.clone())));
        let registry = Arc::new(SinkRegistry::new());
        let pipeline = Arc::new(IngestPipeline::new(
            &config,
            Arc::clone(&publisher),
            Arc::clone(&registry),
        ));
        Harness {
            broker,
            publisher,
            registry,
            pipeline,
            acks: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn harness() -> Harness {
        harness_with(100)
    }

    fn message_from(node: &str, batches: Vec<WriteBatch>) -> ReplicationMessage {
        ReplicationMessage::from_batches("dev", batches, Origin::new(node, 1_000)).unwrap()
    }

    /// One put per id, each with its own origin timestamp.
    fn single_put(node: &str, id: i64) -> ReplicationMessage {
        ReplicationMessage::from_batches(
            "dev",
            vec![WriteBatch::from_write(TableWrite::put("orders", id, json!({"id": id})))],
            Origin::new(node, 1_000 + id as u64),
        )
        .unwrap()
    }

    impl Harness {
        fn delivery(&self, message: &ReplicationMessage, headers: Headers) -> Delivery {
            Delivery::new("txn.dev.orders.east", message.encode().unwrap(), headers)
                .with_acker(Arc::new(CountingAck(Arc::clone(&self.acks))))
        }

        fn east_headers(&self) -> Headers {
            let mut headers = Headers::new();
            headers.insert(ORIGIN_HEADER.to_string(), "east".to_string());
            headers
        }

        fn register_channel(&self, table: &str) -> mpsc::UnboundedReceiver<SinkEvent> {
            let (sink, rx) = ChannelSink::new();
            self.registry.set_subscription("dev", table, Arc::new(sink));
            rx
        }

        async fn relayed(&self) -> Vec<crate::broker::memory::StoredMessage> {
            let key = self.publisher.namer().derive_stream_key("dev", "orders");
            self.broker
                .messages(key.as_str())
                .await
                .into_iter()
                .filter(|m| m.subject == "txn.dev.orders")
                .collect()
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> SinkEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("sink event timed out")
            .expect("sink channel closed")
    }

    mod echo {
        use super::*;

        #[tokio::test]
        async fn test_own_origin_is_acked_and_dropped() {
            let h = harness();
            let mut rx = h.register_channel("orders");

            let msg = single_put("west", 1);
            h.pipeline.handle_delivery(h.delivery(&msg, Headers::new())).await;

            assert_eq!(h.acks.load(Ordering::SeqCst), 1);
            assert!(rx.try_recv().is_err());
            let stats = h.pipeline.stats();
            assert_eq!(stats.echoes_suppressed, 1);
            assert_eq!(stats.dispatched, 0);
            assert_eq!(stats.relayed, 0);
        }

        #[tokio::test]
        async fn test_origin_chain_containing_self_is_dropped() {
            let h = harness();
            let mut rx = h.register_channel("orders");

            let mut headers = Headers::new();
            headers.insert(ORIGIN_HEADER.to_string(), "east,west".to_string());
            h.pipeline
                .handle_delivery(h.delivery(&single_put("east", 1), headers))
                .await;

            assert!(rx.try_recv().is_err());
            assert_eq!(h.pipeline.stats().echoes_suppressed, 1);
        }

        #[tokio::test]
        async fn test_replay_header_overrides_suppression() {
            let h = harness();
            let mut rx = h.register_channel("orders");

            let mut headers = Headers::new();
            headers.insert(REPLAY_HEADER.to_string(), "true".to_string());
            h.pipeline
                .handle_delivery(h.delivery(&single_put("west", 1), headers))
                .await;

            let event = recv(&mut rx).await;
            assert_eq!(event.origin.node_name, "west");
            assert_eq!(h.pipeline.stats().echoes_suppressed, 0);
        }
    }

    mod dispatch {
        use super::*;

        #[tokio::test]
        async fn test_single_write_event() {
            let h = harness();
            let mut rx = h.register_channel("orders");

            h.pipeline
                .handle_delivery(h.delivery(&single_put("east", 7), h.east_headers()))
                .await;

            let event = recv(&mut rx).await;
            assert_eq!(event.value(), Some(&json!({"id": 7})));
            assert_eq!(event.timestamp, 1_007);
            assert_eq!(h.acks.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_chain_becomes_one_transaction_event() {
            let h = harness();
            let mut rx = h.register_channel("orders");

            let msg = message_from(
                "east",
                vec![
                    WriteBatch::from_write(TableWrite::put("orders", 1, json!({"id": 1}))),
                    WriteBatch::from_write(TableWrite::put("items", 9, json!({"id": 9}))),
                ],
            );
            h.pipeline.handle_delivery(h.delivery(&msg, h.east_headers())).await;

            let event = recv(&mut rx).await;
            match &event.payload {
                SinkPayload::Transaction(writes) => {
                    assert_eq!(writes.len(), 2);
                    assert_eq!((writes[0].table.as_str(), writes[0].id.clone()), ("orders", json!(1)));
                    assert_eq!((writes[1].table.as_str(), writes[1].id.clone()), ("items", json!(9)));
                }
                other => panic!("expected transaction, got {:?}", other),
            }
            assert!(rx.try_recv().is_err());
        }

        #[tokio::test]
        async fn test_unknown_sink_dropped_and_pipeline_continues() {
            let h = harness();
            let msg = single_put("east", 1);
            h.pipeline.handle_delivery(h.delivery(&msg, h.east_headers())).await;

            let stats = h.pipeline.stats();
            assert_eq!(stats.unknown_sink, 1);
            assert_eq!(stats.relayed, 0);
            assert_eq!(h.acks.load(Ordering::SeqCst), 1);
            assert!(h.registry.is_empty());

            let mut rx = h.register_channel("orders");
            h.pipeline.handle_delivery(h.delivery(&msg, h.east_headers())).await;
            recv(&mut rx).await;
            assert_eq!(h.pipeline.inflight().in_flight(), 0);
        }

        #[tokio::test]
        async fn test_undecodable_payload_acked() {
            let h = harness();
            let delivery = Delivery::new("txn.dev.orders.east", Bytes::from_static(b"\x00garbage"), Headers::new())
                .with_acker(Arc::new(CountingAck(Arc::clone(&h.acks))));
            h.pipeline.handle_delivery(delivery).await;

            assert_eq!(h.pipeline.stats().decode_failures, 1);
            assert_eq!(h.acks.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_apply_failure_still_acked_and_relayed() {
            let h = harness();
            h.registry.set_subscription("dev", "orders", Arc::new(FailingSink));
            h.pipeline
                .handle_delivery(h.delivery(&single_put("east", 1), h.east_headers()))
                .await;

            h.pipeline.inflight().drain().await.unwrap();
            let stats = h.pipeline.stats();
            assert_eq!(stats.apply_failures, 1);
            assert_eq!(stats.acked, 1);
            assert_eq!(stats.relayed, 1);
        }

        #[tokio::test]
        async fn test_ack_does_not_wait_for_sink() {
            let h = harness();
            let (seen, mut seen_rx) = mpsc::unbounded_channel();
            let gate = Arc::new(Notify::new());
            h.registry.set_subscription(
                "dev",
                "orders",
                Arc::new(GatedSink {
                    seen,
                    gate: Arc::clone(&gate),
                }),
            );

            h.pipeline
                .handle_delivery(h.delivery(&single_put("east", 1), h.east_headers()))
                .await;

            assert_eq!(h.acks.load(Ordering::SeqCst), 1);
            recv(&mut seen_rx).await;
            assert_eq!(h.pipeline.inflight().in_flight(), 1);

            gate.notify_one();
            h.pipeline.inflight().drain().await.unwrap();
            assert_eq!(h.pipeline.inflight().in_flight(), 0);
        }

        #[tokio::test]
        async fn test_commit_hook_updates_stats_and_clock() {
            let h = harness();
            let mut rx = h.register_channel("orders");
            let msg = ReplicationMessage::from_batches(
                "dev",
                vec![WriteBatch::from_write(TableWrite::delete("orders", 1))],
                Origin::new("east", 9_000_000_000_000_000),
            )
            .unwrap();
            h.pipeline.handle_delivery(h.delivery(&msg, h.east_headers())).await;

            recv(&mut rx).await.commit();
            let stats = h.pipeline.stats();
            assert_eq!(stats.applied, 1);
            assert_eq!(stats.last_applied_timestamp, 9_000_000_000_000_000);
            assert!(h.publisher.clock().now_us() > 9_000_000_000_000_000);
        }
    }

    mod duplicates {
        use super::*;

        fn chain(nodes: &str) -> Headers {
            let mut headers = Headers::new();
            headers.insert(ORIGIN_HEADER.to_string(), nodes.to_string());
            headers
        }

        #[tokio::test]
        async fn test_copy_via_another_path_applied_once() {
            let h = harness();
            let mut rx = h.register_channel("orders");
            let msg = single_put("east", 1);

            h.pipeline.handle_delivery(h.delivery(&msg, chain("east"))).await;
            h.pipeline.handle_delivery(h.delivery(&msg, chain("east,north"))).await;

            recv(&mut rx).await;
            sleep(Duration::from_millis(20)).await;
            assert!(rx.try_recv().is_err());

            let stats = h.pipeline.stats();
            assert_eq!(stats.dispatched, 1);
            assert_eq!(stats.duplicates_suppressed, 1);
            assert_eq!(stats.relayed, 1);
            assert_eq!(h.acks.load(Ordering::SeqCst), 2);
            assert_eq!(h.relayed().await.len(), 1);
            assert_eq!(h.pipeline.inflight().in_flight(), 0);
        }

        #[tokio::test]
        async fn test_same_origin_in_other_database_is_distinct() {
            let h = harness();
            let mut dev = h.register_channel("orders");
            let (sink, mut prod) = ChannelSink::new();
            h.registry.set_subscription("prod", "orders", Arc::new(sink));

            let origin = Origin::new("east", 5_000);
            for database in ["dev", "prod"] {
                let msg = ReplicationMessage::from_batches(
                    database,
                    vec![WriteBatch::from_write(TableWrite::delete("orders", 1))],
                    origin.clone(),
                )
                .unwrap();
                h.pipeline.handle_delivery(h.delivery(&msg, chain("east"))).await;
            }

            recv(&mut dev).await;
            recv(&mut prod).await;
            assert_eq!(h.pipeline.stats().duplicates_suppressed, 0);
        }

        #[tokio::test]
        async fn test_replay_applies_again() {
            let h = harness();
            let mut rx = h.register_channel("orders");
            let msg = single_put("east", 1);
            h.pipeline.handle_delivery(h.delivery(&msg, chain("east"))).await;

            let mut headers = chain("east");
            headers.insert(REPLAY_HEADER.to_string(), "true".to_string());
            h.pipeline.handle_delivery(h.delivery(&msg, headers)).await;

            recv(&mut rx).await;
            recv(&mut rx).await;
            assert_eq!(h.pipeline.stats().duplicates_suppressed, 0);
        }

        #[test]
        fn test_window_forgets_oldest() {
            let mut window = SeenWindow::new(2);
            let key = |ts: u64| ("east".to_string(), ts, "dev".to_string());
            assert!(window.insert(key(1)));
            assert!(window.insert(key(2)));
            assert!(!window.insert(key(1)));

            assert!(window.insert(key(3)));
            assert!(window.insert(key(1)));
            assert!(!window.insert(key(3)));
            assert_eq!(window.order.len(), 2);
            assert_eq!(window.keys.len(), 2);
        }
    }

    mod relay {
        use super::*;

        #[tokio::test]
        async fn test_relayed_once_with_identical_bytes() {
            let h = harness();
            let _rx = h.register_channel("orders");
            let msg = single_put("east", 1);
            let payload = msg.encode().unwrap();

            h.pipeline.handle_delivery(h.delivery(&msg, h.east_headers())).await;

            let relayed = h.relayed().await;
            assert_eq!(relayed.len(), 1);
            assert_eq!(relayed[0].payload, payload);
            assert_eq!(origin_chain(&relayed[0].headers), vec!["east", "west"]);
        }

        #[tokio::test]
        async fn test_relay_disabled() {
            let config = ReplicationConfig::new("west");
            let broker = MemoryBroker::new();
            let publisher = Arc::new(Publisher::new(&config, Arc::new(broker.clone())));
            let registry = Arc::new(SinkRegistry::new());
            let (sink, _rx) = ChannelSink::new();
            registry.set_subscription("dev", "orders", Arc::new(sink));
            let pipeline = IngestPipeline::new(&config, publisher, registry).without_relay();

            pipeline
                .handle_delivery(Delivery::new(
                    "txn.dev.orders.east",
                    single_put("east", 1).encode().unwrap(),
                    Headers::new(),
                ))
                .await;
            assert_eq!(pipeline.stats().relayed, 0);
            assert!(broker.stream_names().await.is_empty());
        }

        #[tokio::test]
        async fn test_relay_failure_counted() {
            let h = harness();
            let _rx = h.register_channel("orders");
            h.broker.fail_publishes_matching("txn.dev.orders").await;

            h.pipeline
                .handle_delivery(h.delivery(&single_put("east", 1), h.east_headers()))
                .await;
            let stats = h.pipeline.stats();
            assert_eq!(stats.relay_failures, 1);
            assert_eq!(stats.acked, 1);
        }
    }

    mod running {
        use super::*;

        async fn publish_inbound(h: &Harness, message: &ReplicationMessage) {
            let mut headers = Headers::new();
            headers.insert(ORIGIN_HEADER.to_string(), message.origin.node_name.clone());
            h.broker
                .publish("txn.inbound.west", message.encode().unwrap(), headers)
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn test_run_consumes_inbound_and_acks() {
            let h = harness();
            let mut rx = h.register_channel("orders");
            let handle = h.pipeline.start().await.unwrap();

            publish_inbound(&h, &single_put("east", 1)).await;
            publish_inbound(&h, &single_put("west", 2)).await;
            publish_inbound(&h, &single_put("east", 3)).await;

            assert_eq!(recv(&mut rx).await.value(), Some(&json!({"id": 1})));
            assert_eq!(recv(&mut rx).await.value(), Some(&json!({"id": 3})));

            h.pipeline.abort_handle().abort();
            timeout(Duration::from_secs(1), handle).await.unwrap().unwrap().unwrap();
            assert_eq!(h.pipeline.state().await, PipelineState::Stopped);

            let stats = h.pipeline.stats();
            assert_eq!(stats.received, 3);
            assert_eq!(stats.echoes_suppressed, 1);
            assert_eq!(h.broker.acked_count("txn_inbound_west").await, 3);
        }

        #[tokio::test]
        async fn test_abort_stops_pulling() {
            let h = harness();
            let _rx = h.register_channel("orders");
            let handle = h.pipeline.start().await.unwrap();

            h.pipeline.abort_handle().abort();
            timeout(Duration::from_secs(1), handle).await.unwrap().unwrap().unwrap();

            publish_inbound(&h, &single_put("east", 1)).await;
            sleep(Duration::from_millis(20)).await;
            assert_eq!(h.pipeline.stats().received, 0);
            assert_eq!(h.broker.pending_count("txn_inbound_west").await, 1);
        }

        #[tokio::test]
        async fn test_run_twice_rejected() {
            let h = harness();
            let handle = h.pipeline.start().await.unwrap();
            while h.pipeline.state().await != PipelineState::Running {
                tokio::task::yield_now().await;
            }
            let second = h.pipeline.subscribe().await.unwrap();
            assert!(matches!(h.pipeline.run(second).await, Err(ReplError::Shutdown)));
            h.pipeline.abort_handle().abort();
            timeout(Duration::from_secs(1), handle).await.unwrap().unwrap().unwrap();
        }

        #[tokio::test]
        async fn test_inflight_bound_stalls_pulling() {
            let h = harness_with(2);
            let (seen, mut seen_rx) = mpsc::unbounded_channel();
            let gate = Arc::new(Notify::new());
            h.registry.set_subscription(
                "dev",
                "orders",
                Arc::new(GatedSink {
                    seen,
                    gate: Arc::clone(&gate),
                }),
            );
            let handle = h.pipeline.start().await.unwrap();

            for id in 1..=4 {
                publish_inbound(&h, &single_put("east", id)).await;
            }

            recv(&mut seen_rx).await;
            recv(&mut seen_rx).await;
            sleep(Duration::from_millis(50)).await;
            assert_eq!(h.pipeline.stats().dispatched, 2);
            assert!(seen_rx.try_recv().is_err());

            for _ in 0..4 {
                gate.notify_one();
                sleep(Duration::from_millis(10)).await;
            }
            h.pipeline.abort_handle().abort();
            timeout(Duration::from_secs(1), handle).await.unwrap().unwrap().unwrap();

            assert_eq!(h.pipeline.stats().dispatched, 4);
            assert!(h.pipeline.inflight().peak() <= 2);
        }
    }
}
