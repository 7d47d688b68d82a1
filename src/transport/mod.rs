//! Subject-based publish/subscribe transport.
//!
//! The broker uses the transport for three things:
//! - production ingestion (queue subscriptions on partition subjects)
//! - acks (plain subscriptions on per-call or per-session inboxes)
//! - control channels (replication catch-up and Raft RPC, via request/reply)
//!
//! Subjects are matched exactly; there are no wildcards.

mod local;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use local::LocalTransport;

/// A message received from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Transport failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("request on {subject} timed out after {timeout:?}")]
    Timeout { subject: String, timeout: Duration },

    #[error("no responders for {0}")]
    NoResponders(String),

    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
}

/// Removes a subscription from whatever registry delivered to it.
pub trait SubscriptionRegistry: Send + Sync {
    fn remove(&self, subject: &str, id: u64);
}

/// A live subscription. Unsubscribes when dropped.
pub struct Subscription {
    id: u64,
    subject: String,
    rx: mpsc::Receiver<TransportMessage>,
    registry: Arc<dyn SubscriptionRegistry>,
}

impl Subscription {
    pub fn new(
        id: u64,
        subject: impl Into<String>,
        rx: mpsc::Receiver<TransportMessage>,
        registry: Arc<dyn SubscriptionRegistry>,
    ) -> Self {
        Self {
            id,
            subject: subject.into(),
            rx,
            registry,
        }
    }

    /// Wait for the next message. `None` once the transport shut down.
    pub async fn next(&mut self) -> Option<TransportMessage> {
        self.rx.recv().await
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Explicitly unsubscribe. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(&self.subject, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .finish()
    }
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish with an optional reply subject.
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<(), TransportError>;

    /// Subscribe to every message on a subject.
    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError>;

    /// Subscribe as a member of a queue group: each message is delivered to one
    /// member of the group.
    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Subscription, TransportError>;

    /// A unique subject suitable for replies.
    fn new_inbox(&self) -> String;

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), TransportError> {
        self.publish_with_reply(subject, None, payload).await
    }

    /// Publish and wait for the first reply. The reply subscription is
    /// released on every exit path.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<TransportMessage, TransportError> {
        let inbox = self.new_inbox();
        let mut sub = self.subscribe(&inbox).await?;
        self.publish_with_reply(subject, Some(&inbox), payload)
            .await?;
        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout {
                subject: subject.to_string(),
                timeout,
            }),
        }
    }
}
