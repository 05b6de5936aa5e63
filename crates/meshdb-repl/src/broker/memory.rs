//! In-process broker.
//!
//! Implements the [`Broker`] contract with NATS-style subject matching,
//! stream capture, stream sourcing, durable queue-grouped consumers and
//! request/reply inboxes. Several nodes can share one `MemoryBroker` to
//! simulate a mesh. It also records acks and flushes so tests can assert on
//! them, and can be told to fail publishes for chosen subjects.

use super::{AckPolicy, Acker, Broker, ConsumerOptions, DeliverPolicy, Delivery, Headers, Subscription};
use crate::error::{ReplError, Result};
use crate::subject::subject_matches;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// A message retained in a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// Per-stream sequence number, starting at 1.
    pub seq: u64,
    /// Subject it was published on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Headers.
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq)]
struct StreamSource {
    stream: String,
    filter: Option<String>,
}

struct ConsumerGroup {
    options: ConsumerOptions,
    members: Vec<mpsc::UnboundedSender<Delivery>>,
    cursor: usize,
}

#[derive(Default)]
struct StreamState {
    subjects: Vec<String>,
    sources: Vec<StreamSource>,
    messages: Vec<StoredMessage>,
    acked: HashSet<u64>,
    consumers: BTreeMap<String, ConsumerGroup>,
    last_seq: u64,
}

struct CoreSub {
    pattern: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct BrokerState {
    streams: BTreeMap<String, StreamState>,
    core_subs: Vec<CoreSub>,
    queue_cursors: BTreeMap<String, usize>,
    flushes: u64,
    failing_subjects: Vec<String>,
}

struct MemoryAck {
    state: Arc<Mutex<BrokerState>>,
    stream: String,
    seq: u64,
}

#[async_trait]
impl Acker for MemoryAck {
    async fn ack(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let stream = state
            .streams
            .get_mut(&self.stream)
            .ok_or_else(|| ReplError::Broker {
                msg: format!("ack for deleted stream {}", self.stream),
            })?;
        stream.acked.insert(self.seq);
        Ok(())
    }
}

/// In-process broker shared by cloning.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all streams.
    pub async fn stream_names(&self) -> Vec<String> {
        self.state.lock().await.streams.keys().cloned().collect()
    }

    /// Subjects captured by a stream.
    pub async fn stream_subjects(&self, stream: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| s.subjects.clone())
            .unwrap_or_default()
    }

    /// Streams sourced into `stream`.
    pub async fn stream_sources(&self, stream: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| s.sources.iter().map(|src| src.stream.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages retained in a stream, oldest first.
    pub async fn messages(&self, stream: &str) -> Vec<StoredMessage> {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Number of acknowledged messages in a stream.
    pub async fn acked_count(&self, stream: &str) -> usize {
        let state = self.state.lock().await;
        state.streams.get(stream).map(|s| s.acked.len()).unwrap_or(0)
    }

    /// Number of retained messages not yet acknowledged.
    pub async fn pending_count(&self, stream: &str) -> usize {
        let state = self.state.lock().await;
        state
            .streams
            .get(stream)
            .map(|s| s.messages.len() - s.acked.len())
            .unwrap_or(0)
    }

    /// Number of `flush` calls so far.
    pub async fn flush_count(&self) -> u64 {
        self.state.lock().await.flushes
    }

    /// Make every publish on a subject matching `pattern` fail with a broker error.
    pub async fn fail_publishes_matching(&self, pattern: &str) {
        self.state
            .lock()
            .await
            .failing_subjects
            .push(pattern.to_string());
    }

    /// Stop injecting publish failures.
    pub async fn clear_failures(&self) {
        self.state.lock().await.failing_subjects.clear();
    }
}

impl BrokerState {
    /// Streams that store a message published on `subject`: the ones whose
    /// subjects capture it, then (transitively) the ones sourcing from those.
    fn capturing_streams(&self, subject: &str) -> Vec<String> {
        let mut result: Vec<String> = self
            .streams
            .iter()
            .filter(|(_, s)| s.subjects.iter().any(|p| subject_matches(p, subject)))
            .map(|(name, _)| name.clone())
            .collect();

        let mut i = 0;
        while i < result.len() {
            let current = result[i].clone();
            for (name, stream) in &self.streams {
                if result.contains(name) {
                    continue;
                }
                let sourced = stream.sources.iter().any(|src| {
                    src.stream == current
                        && src
                            .filter
                            .as_deref()
                            .map_or(true, |f| subject_matches(f, subject))
                });
                if sourced {
                    result.push(name.clone());
                }
            }
            i += 1;
        }
        result
    }

    fn append(
        &mut self,
        shared: &Arc<Mutex<BrokerState>>,
        stream_name: &str,
        subject: &str,
        payload: &Bytes,
        headers: &Headers,
    ) {
        let Some(stream) = self.streams.get_mut(stream_name) else {
            return;
        };
        stream.last_seq += 1;
        let message = StoredMessage {
            seq: stream.last_seq,
            subject: subject.to_string(),
            payload: payload.clone(),
            headers: headers.clone(),
        };

        let StreamState {
            consumers, acked, ..
        } = &mut *stream;
        for group in consumers.values_mut() {
            if dispatch(group, shared, stream_name, &message) && group.options.ack_policy == AckPolicy::None {
                acked.insert(message.seq);
            }
        }
        stream.messages.push(message);
    }

    /// Deliver to plain subscribers. Each queue group gets one copy.
    fn deliver_core(
        &mut self,
        subject: &str,
        payload: &Bytes,
        headers: &Headers,
        reply_to: Option<&str>,
    ) -> usize {
        self.core_subs.retain(|s| !s.sender.is_closed());

        let make = || {
            let delivery = Delivery::new(subject, payload.clone(), headers.clone());
            match reply_to {
                Some(reply) => delivery.with_reply_to(reply),
                None => delivery,
            }
        };

        let mut delivered = 0;
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, sub) in self.core_subs.iter().enumerate() {
            if !subject_matches(&sub.pattern, subject) {
                continue;
            }
            match &sub.queue_group {
                Some(group) => groups.entry(group.clone()).or_default().push(idx),
                None => {
                    if sub.sender.send(make()).is_ok() {
                        delivered += 1;
                    }
                }
            }
        }

        for (group, members) in groups {
            let cursor = self.queue_cursors.entry(group).or_insert(0);
            let idx = members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            if self.core_subs[idx].sender.send(make()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Hand a stream message to one member of a consumer group, dropping members
/// whose receivers are gone. Returns false if nobody took it.
fn dispatch(
    group: &mut ConsumerGroup,
    shared: &Arc<Mutex<BrokerState>>,
    stream_name: &str,
    message: &StoredMessage,
) -> bool {
    let mut delivery = stream_delivery(&group.options, shared, stream_name, message);
    while !group.members.is_empty() {
        let idx = group.cursor % group.members.len();
        group.cursor = group.cursor.wrapping_add(1);
        match group.members[idx].send(delivery) {
            Ok(()) => return true,
            Err(mpsc::error::SendError(returned)) => {
                delivery = returned;
                group.members.remove(idx);
            }
        }
    }
    false
}

fn stream_delivery(
    options: &ConsumerOptions,
    shared: &Arc<Mutex<BrokerState>>,
    stream_name: &str,
    message: &StoredMessage,
) -> Delivery {
    let delivery = Delivery::new(
        message.subject.clone(),
        message.payload.clone(),
        message.headers.clone(),
    );
    match options.ack_policy {
        AckPolicy::Explicit => delivery.with_acker(Arc::new(MemoryAck {
            state: Arc::clone(shared),
            stream: stream_name.to_string(),
            seq: message.seq,
        })),
        AckPolicy::None => delivery,
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn create_stream(&self, name: &str, subjects: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        let stream = state.streams.entry(name.to_string()).or_default();
        for subject in subjects {
            if !stream.subjects.contains(subject) {
                stream.subjects.push(subject.clone());
            }
        }
        info!(stream = name, subjects = ?stream.subjects, "stream created or extended");
        Ok(())
    }

    async fn add_stream_source(
        &self,
        stream: &str,
        source: &str,
        filter_subject: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let target = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| ReplError::StreamNotFound {
                subject: stream.to_string(),
            })?;
        let entry = StreamSource {
            stream: source.to_string(),
            filter: filter_subject.map(str::to_string),
        };
        if !target.sources.contains(&entry) {
            target.sources.push(entry);
        }
        Ok(())
    }

    async fn open_durable_consumer(
        &self,
        stream: &str,
        options: ConsumerOptions,
    ) -> Result<Subscription> {
        let mut state = self.state.lock().await;
        let stream_state = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| ReplError::StreamNotFound {
                subject: stream.to_string(),
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        match stream_state.consumers.get_mut(&options.durable_name) {
            Some(group) => group.members.push(tx),
            None => {
                if options.deliver_policy == DeliverPolicy::All {
                    for message in &stream_state.messages {
                        if stream_state.acked.contains(&message.seq) {
                            continue;
                        }
                        let _ = tx.send(stream_delivery(&options, &self.state, stream, message));
                    }
                }
                stream_state.consumers.insert(
                    options.durable_name.clone(),
                    ConsumerGroup {
                        options,
                        members: vec![tx],
                        cursor: 0,
                    },
                );
            }
        }
        debug!(stream, "durable consumer opened");
        Ok(Subscription::new(stream, rx))
    }

    async fn publish(&self, subject: &str, payload: Bytes, headers: Headers) -> Result<()> {
        let mut state = self.state.lock().await;
        if state
            .failing_subjects
            .iter()
            .any(|p| subject_matches(p, subject))
        {
            return Err(ReplError::Broker {
                msg: format!("injected publish failure on {}", subject),
            });
        }

        let targets = state.capturing_streams(subject);
        if targets.is_empty() {
            return Err(ReplError::StreamNotFound {
                subject: subject.to_string(),
            });
        }
        for name in &targets {
            state.append(&self.state, name, subject, &payload, &headers);
        }
        state.deliver_core(subject, &payload, &headers, None);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.state.lock().await.flushes += 1;
        Ok(())
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().await.core_subs.push(CoreSub {
            pattern: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            sender: tx,
        });
        Ok(Subscription::new(subject, rx))
    }

    async fn request(&self, subject: &str, payload: Bytes) -> Result<Subscription> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state.core_subs.push(CoreSub {
            pattern: inbox.clone(),
            queue_group: None,
            sender: tx,
        });

        let delivered = state.deliver_core(subject, &payload, &Headers::new(), Some(&inbox));
        if delivered == 0 {
            state.core_subs.retain(|s| s.pattern != inbox);
            return Err(ReplError::NoResponders {
                subject: subject.to_string(),
            });
        }
        Ok(Subscription::new(inbox, rx))
    }

    async fn respond(&self, reply_to: &str, payload: Bytes) -> Result<()> {
        let mut state = self.state.lock().await;
        state.deliver_core(reply_to, &payload, &Headers::new(), None);
        Ok(())
    }
}
