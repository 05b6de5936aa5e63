//! Broker abstraction consumed by the replication core.
//!
//! The broker is an external streaming service. Everything the core needs
//! from it is expressed by the [`Broker`] trait so the connection can be
//! constructed once at startup and injected, and so tests can run against
//! [`memory::MemoryBroker`].

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message headers.
pub type Headers = BTreeMap<String, String>;

/// When a consumer must acknowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Every delivery must be acked individually.
    #[default]
    Explicit,
    /// Deliveries are considered acked on send.
    None,
}

/// Where a newly created durable consumer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverPolicy {
    /// Start with the first message retained in the stream.
    All,
    /// Start with the next message published.
    #[default]
    New,
}

/// Options for a durable stream consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Durable consumer name; its cursor survives reconnects.
    pub durable_name: String,
    /// Queue group; each delivery goes to one member of the group.
    pub queue_group: Option<String>,
    /// Ack policy.
    pub ack_policy: AckPolicy,
    /// Deliver policy.
    pub deliver_policy: DeliverPolicy,
}

impl ConsumerOptions {
    /// Explicit-ack consumer that starts at new messages.
    pub fn durable(durable_name: impl Into<String>) -> Self {
        Self {
            durable_name: durable_name.into(),
            queue_group: None,
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::New,
        }
    }

    /// Set the queue group.
    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    /// Set the deliver policy.
    pub fn with_deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }
}

/// Acknowledges one delivery back to the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Acknowledge the delivery.
    async fn ack(&self) -> Result<()>;
}

/// A message handed to a subscriber.
pub struct Delivery {
    /// Subject the message was published on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
    /// Message headers.
    pub headers: Headers,
    /// Reply subject for request/reply traffic.
    pub reply_to: Option<String>,
    acker: Option<Arc<dyn Acker>>,
}

impl Delivery {
    /// A delivery that needs no acknowledgment.
    pub fn new(subject: impl Into<String>, payload: Bytes, headers: Headers) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers,
            reply_to: None,
            acker: None,
        }
    }

    /// Attach an acker.
    pub fn with_acker(mut self, acker: Arc<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Attach a reply subject.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Acknowledge the delivery. A no-op for deliveries without an acker.
    pub async fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("reply_to", &self.reply_to)
            .finish()
    }
}

/// An ordered sequence of deliveries.
#[derive(Debug)]
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Wrap a receiver. Broker adapters forward their native stream into the sender half.
    pub fn new(subject: impl Into<String>, receiver: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            subject: subject.into(),
            receiver,
        }
    }

    /// Subject or stream this subscription reads.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next delivery, or `None` once the broker side is closed.
    pub async fn next(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

/// Operations the replication core needs from the message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create a stream capturing `subjects`, or add `subjects` to an existing stream.
    async fn create_stream(&self, name: &str, subjects: &[String]) -> Result<()>;

    /// Copy every message stored in `source` (optionally filtered by subject)
    /// into `stream` as it arrives.
    async fn add_stream_source(
        &self,
        stream: &str,
        source: &str,
        filter_subject: Option<&str>,
    ) -> Result<()>;

    /// Open (or join) a durable consumer on `stream`.
    async fn open_durable_consumer(
        &self,
        stream: &str,
        options: ConsumerOptions,
    ) -> Result<Subscription>;

    /// Publish into whatever stream captures `subject`.
    ///
    /// Fails with [`ReplError::StreamNotFound`](crate::error::ReplError::StreamNotFound)
    /// or `NoResponders` when no stream does.
    async fn publish(&self, subject: &str, payload: Bytes, headers: Headers) -> Result<()>;

    /// Block until the broker has acknowledged everything published so far.
    async fn flush(&self) -> Result<()>;

    /// Plain (non-stream) subscription to a subject pattern.
    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<Subscription>;

    /// Send a request and subscribe to every reply it gets.
    async fn request(&self, subject: &str, payload: Bytes) -> Result<Subscription>;

    /// Reply to a request.
    async fn respond(&self, reply_to: &str, payload: Bytes) -> Result<()>;
}

/// Shared broker handle.
pub type SharedBroker = Arc<dyn Broker>;
