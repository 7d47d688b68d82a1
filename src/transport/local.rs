//! In-process transport.
//!
//! Every subscriber gets a bounded queue. Publishing never blocks: a message
//! for a full queue is dropped for that subscriber and counted, which mirrors
//! the slow-consumer behavior of networked pub/sub systems.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

use super::{
    Subscription, SubscriptionRegistry, Transport, TransportError, TransportMessage,
};
use crate::cluster::metrics;
use crate::constants::DEFAULT_TRANSPORT_QUEUE_CAPACITY;

#[derive(Clone)]
struct Subscriber {
    id: u64,
    group: Option<String>,
    tx: mpsc::Sender<TransportMessage>,
}

struct Bus {
    subjects: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
    next_inbox: AtomicU64,
    group_cursor: AtomicUsize,
    queue_capacity: usize,
    inbox_prefix: String,
}

impl SubscriptionRegistry for Bus {
    fn remove(&self, subject: &str, id: u64) {
        let now_empty = match self.subjects.get_mut(subject) {
            Some(mut subs) => {
                subs.retain(|s| s.id != id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.subjects.remove_if(subject, |_, subs| subs.is_empty());
        }
    }
}

/// Shared in-process bus. Clones share the same subjects.
#[derive(Clone)]
pub struct LocalTransport {
    bus: Arc<Bus>,
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TRANSPORT_QUEUE_CAPACITY)
    }

    /// Use `queue_capacity` as the per-subscriber queue depth.
    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            bus: Arc::new(Bus {
                subjects: DashMap::new(),
                next_id: AtomicU64::new(1),
                next_inbox: AtomicU64::new(1),
                group_cursor: AtomicUsize::new(0),
                queue_capacity: queue_capacity.max(1),
                inbox_prefix: format!("_INBOX.{:016x}", fastrand::u64(..)),
            }),
        }
    }

    /// Number of live subscriptions on a subject.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.bus.subjects.get(subject).map(|s| s.len()).unwrap_or(0)
    }

    fn register(
        &self,
        subject: &str,
        group: Option<&str>,
    ) -> Result<Subscription, TransportError> {
        if subject.is_empty() || subject.contains(char::is_whitespace) {
            return Err(TransportError::InvalidSubject(subject.to_string()));
        }
        let id = self.bus.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.bus.queue_capacity);
        self.bus
            .subjects
            .entry(subject.to_string())
            .or_default()
            .push(Subscriber {
                id,
                group: group.map(str::to_string),
                tx,
            });
        let registry: Arc<dyn SubscriptionRegistry> = self.bus.clone();
        Ok(Subscription::new(id, subject, rx, registry))
    }

    /// Pick recipients: every plain subscriber plus one member per queue group.
    fn recipients(&self, subject: &str) -> Vec<Subscriber> {
        let Some(subs) = self.bus.subjects.get(subject) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(subs.len());
        let mut groups: HashMap<&str, Vec<&Subscriber>> = HashMap::new();
        for sub in subs.iter() {
            match &sub.group {
                None => out.push(sub.clone()),
                Some(group) => groups.entry(group.as_str()).or_default().push(sub),
            }
        }
        if !groups.is_empty() {
            let cursor = self.bus.group_cursor.fetch_add(1, Ordering::Relaxed);
            for members in groups.values() {
                out.push(members[cursor % members.len()].clone());
            }
        }
        out
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<(), TransportError> {
        let recipients = self.recipients(subject);
        if recipients.is_empty() && reply.is_some() {
            return Err(TransportError::NoResponders(subject.to_string()));
        }

        for sub in recipients {
            let msg = TransportMessage {
                subject: subject.to_string(),
                reply: reply.map(str::to_string),
                payload: payload.clone(),
            };
            match sub.tx.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(subject, subscriber = sub.id, "Subscriber queue full, dropping message");
                    metrics::TRANSPORT_DROPPED.with_label_values(&["full"]).inc();
                }
                Err(TrySendError::Closed(_)) => {
                    trace!(subject, subscriber = sub.id, "Subscriber gone");
                    self.bus.remove(subject, sub.id);
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, TransportError> {
        self.register(subject, None)
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Subscription, TransportError> {
        self.register(subject, Some(group))
    }

    fn new_inbox(&self) -> String {
        let n = self.bus.next_inbox.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}", self.bus.inbox_prefix, n)
    }
}
