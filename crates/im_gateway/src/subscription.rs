//! Per-identity fanout bus.
//!
//! A gateway subscribes the channel of the identity it serves; the routing
//! service publishes one packet per resolved recipient. Delivery is
//! at-most-once: a publish with no subscriber is simply lost.
//!
//! Two implementations:
//! - [`LocalFanoutBus`]: in-process, for single-node deployments and tests
//! - [`NatsFanoutBus`]: NATS core subjects, so senders never need to know
//!   which process holds the recipient's socket

use crate::error::{GatewayError, Result};
use crate::protocol::Packet;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use metrics::counter;
use nats_client::NatsClient;
use std::fmt::Write;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default NATS subject prefix for delivery subjects.
pub const DEFAULT_SUBJECT_PREFIX: &str = "im.deliver";

/// Publish/subscribe keyed by identity.
#[async_trait]
pub trait FanoutBus: Send + Sync {
    /// Best-effort publish to whatever is subscribed under `identity`.
    async fn publish(&self, identity: &str, packet: &Packet) -> Result<()>;

    /// Subscribe to packets published under `identity`.
    async fn subscribe(&self, identity: &str) -> Result<Subscription>;
}

/// Live subscription. Packets arrive in publication order per publisher.
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription {
    identity: String,
    rx: mpsc::UnboundedReceiver<Packet>,
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        identity: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Packet>,
        detach: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            identity: identity.into(),
            rx,
            detach: Some(Box::new(detach)),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Next packet, or `None` once unsubscribed and drained.
    pub async fn next(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Stop delivery. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(detach) = self.detach.take() {
            debug!("Unsubscribing {}", self.identity);
            detach();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// ============================================================================
// In-process Bus
// ============================================================================

type SubscriberList = Vec<(Uuid, mpsc::UnboundedSender<Packet>)>;

/// In-process bus backed by a DashMap of identity → subscribers.
#[derive(Clone, Default)]
pub struct LocalFanoutBus {
    subscribers: Arc<DashMap<String, SubscriberList>>,
}

impl LocalFanoutBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions for `identity`.
    pub fn subscriber_count(&self, identity: &str) -> usize {
        self.subscribers
            .get(identity)
            .map(|list| list.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl FanoutBus for LocalFanoutBus {
    async fn publish(&self, identity: &str, packet: &Packet) -> Result<()> {
        let Some(mut list) = self.subscribers.get_mut(identity) else {
            debug!("No subscriber for {}, dropping packet", identity);
            return Ok(());
        };

        list.retain(|(_, tx)| tx.send(packet.clone()).is_ok());
        let empty = list.is_empty();
        drop(list);

        if empty {
            self.subscribers.remove_if(identity, |_, list| list.is_empty());
        }
        Ok(())
    }

    async fn subscribe(&self, identity: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers
            .entry(identity.to_string())
            .or_default()
            .push((id, tx));

        let subscribers = self.subscribers.clone();
        let key = identity.to_string();
        Ok(Subscription::new(identity, rx, move || {
            if let Some(mut list) = subscribers.get_mut(&key) {
                list.retain(|(sub_id, _)| *sub_id != id);
            }
            subscribers.remove_if(&key, |_, list| list.is_empty());
        }))
    }
}

// ============================================================================
// NATS Bus
// ============================================================================

/// Build the delivery subject for an identity.
///
/// Identities made only of `[A-Za-z0-9_-]` and not starting with `x` are used
/// verbatim; anything else is hex-encoded behind an `x` marker so the token
/// stays a single subject segment.
pub fn identity_subject(prefix: &str, identity: &str) -> String {
    let verbatim = !identity.is_empty()
        && !identity.starts_with('x')
        && identity
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');

    if verbatim {
        return format!("{}.{}", prefix, identity);
    }

    let mut subject = String::with_capacity(prefix.len() + 2 + identity.len() * 2);
    subject.push_str(prefix);
    subject.push_str(".x");
    for b in identity.bytes() {
        let _ = write!(subject, "{:02x}", b);
    }
    subject
}

/// Bus over NATS core subjects (`<prefix>.<identity token>`).
pub struct NatsFanoutBus {
    client: Arc<NatsClient>,
    prefix: String,
}

impl NatsFanoutBus {
    pub fn new(client: Arc<NatsClient>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl FanoutBus for NatsFanoutBus {
    async fn publish(&self, identity: &str, packet: &Packet) -> Result<()> {
        let subject = identity_subject(&self.prefix, identity);
        let payload = Bytes::from(serde_json::to_vec(packet)?);
        self.client
            .publish_fast(&subject, payload)
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))
    }

    async fn subscribe(&self, identity: &str) -> Result<Subscription> {
        let subject = identity_subject(&self.prefix, identity);
        let mut subscriber = self
            .client
            .subscribe(&subject)
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = task_cancel.cancelled() => break,

                    msg = subscriber.next() => {
                        let Some(msg) = msg else {
                            warn!("NATS subscription for {} ended unexpectedly", subject);
                            break;
                        };
                        match serde_json::from_slice::<Packet>(&msg.payload) {
                            Ok(packet) => {
                                if tx.send(packet).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Malformed packet on {}: {}", subject, e);
                                counter!("im_packets_dropped_total").increment(1);
                            }
                        }
                    }
                }
            }

            if let Err(e) = subscriber.unsubscribe().await {
                debug!("NATS unsubscribe for {} failed: {}", subject, e);
            }
        });

        Ok(Subscription::new(identity, rx, move || cancel.cancel()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_bus_preserves_publish_order() {
        let bus = LocalFanoutBus::new();
        let mut sub = bus.subscribe("u2").await.unwrap();

        for i in 0..20 {
            bus.publish("u2", &Packet::direct("u1", "u2", &i.to_string()))
                .await
                .unwrap();
        }

        for i in 0..20 {
            assert_eq!(sub.next().await.unwrap().content, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_dropped() {
        let bus = LocalFanoutBus::new();
        bus.publish("nobody", &Packet::direct("u1", "nobody", "hi"))
            .await
            .unwrap();
        assert_eq!(bus.subscriber_count("nobody"), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_stops_delivery() {
        let bus = LocalFanoutBus::new();
        let mut sub = bus.subscribe("u2").await.unwrap();
        assert_eq!(bus.subscriber_count("u2"), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count("u2"), 0);

        bus.publish("u2", &Packet::direct("u1", "u2", "late"))
            .await
            .unwrap();
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_detaches_only_that_subscription() {
        let bus = LocalFanoutBus::new();
        let old = bus.subscribe("u2").await.unwrap();
        let mut new = bus.subscribe("u2").await.unwrap();
        assert_eq!(bus.subscriber_count("u2"), 2);

        drop(old);
        assert_eq!(bus.subscriber_count("u2"), 1);

        bus.publish("u2", &Packet::direct("u1", "u2", "hi"))
            .await
            .unwrap();
        assert_eq!(new.next().await.unwrap().content, "hi");
    }

    #[test]
    fn test_identity_subject_encoding() {
        assert_eq!(identity_subject("im.deliver", "user_42"), "im.deliver.user_42");
        assert_eq!(identity_subject("im.deliver", "a.b"), "im.deliver.x612e62");
        assert_eq!(identity_subject("im.deliver", "x1"), "im.deliver.x7831");
        assert_eq!(identity_subject("im.deliver", ""), "im.deliver.x");
        assert_ne!(
            identity_subject("p", "x616263"),
            identity_subject("p", "abc")
        );
    }
}
