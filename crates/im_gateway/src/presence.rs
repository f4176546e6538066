//! Presence lookups that see past the local process.
//!
//! Endpoints live on the process holding the identity's socket. With a
//! single process the local runtime is the whole picture; with NATS each
//! process answers presence requests for the identities it serves, so any
//! process can ask.

use crate::client::ConnectionId;
use crate::endpoint::EndpointRuntime;
use crate::error::{GatewayError, Result};
use crate::subscription::identity_subject;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use metrics::counter;
use nats_client::NatsClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default NATS subject prefix for presence requests.
pub const DEFAULT_PRESENCE_PREFIX: &str = "im.presence";

const PRESENT: &[u8] = b"1";
const ABSENT: &[u8] = b"0";

/// Answers "is this identity connected anywhere".
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    /// Mark `session` online for `identity` on this process.
    async fn online(&self, identity: &str, session: ConnectionId) -> Result<usize>;

    /// Mark `session` offline for `identity` on this process.
    async fn offline(&self, identity: &str, session: ConnectionId) -> Result<usize>;

    /// Whether `identity` has a live session on any process.
    async fn is_online(&self, identity: &str) -> Result<bool>;

    /// Answer remote presence requests for `identity` until `cancel` fires.
    async fn advertise(&self, identity: &str, cancel: CancellationToken) -> Result<()>;

    /// The local endpoint runtime.
    fn endpoints(&self) -> &Arc<EndpointRuntime>;
}

/// Presence for a single process: the local runtime is authoritative.
pub struct LocalPresence {
    endpoints: Arc<EndpointRuntime>,
}

impl LocalPresence {
    pub fn new(endpoints: Arc<EndpointRuntime>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl PresenceDirectory for LocalPresence {
    async fn online(&self, identity: &str, session: ConnectionId) -> Result<usize> {
        self.endpoints.online(identity, session).await
    }

    async fn offline(&self, identity: &str, session: ConnectionId) -> Result<usize> {
        self.endpoints.offline(identity, session).await
    }

    async fn is_online(&self, identity: &str) -> Result<bool> {
        self.endpoints.is_online(identity).await
    }

    async fn advertise(&self, _identity: &str, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    fn endpoints(&self) -> &Arc<EndpointRuntime> {
        &self.endpoints
    }
}

/// Presence across processes sharing a NATS server.
///
/// A process serving an identity subscribes `<prefix>.<identity token>` and
/// replies with its local endpoint's answer. A request nobody answers means
/// the identity is not connected anywhere.
pub struct NatsPresence {
    client: Arc<NatsClient>,
    endpoints: Arc<EndpointRuntime>,
    prefix: String,
    query_timeout: Duration,
}

impl NatsPresence {
    pub fn new(
        client: Arc<NatsClient>,
        endpoints: Arc<EndpointRuntime>,
        prefix: impl Into<String>,
        query_timeout: Duration,
    ) -> Self {
        Self {
            client,
            endpoints,
            prefix: prefix.into(),
            query_timeout,
        }
    }
}

#[async_trait]
impl PresenceDirectory for NatsPresence {
    async fn online(&self, identity: &str, session: ConnectionId) -> Result<usize> {
        self.endpoints.online(identity, session).await
    }

    async fn offline(&self, identity: &str, session: ConnectionId) -> Result<usize> {
        self.endpoints.offline(identity, session).await
    }

    async fn is_online(&self, identity: &str) -> Result<bool> {
        if self.endpoints.is_online(identity).await? {
            return Ok(true);
        }

        let subject = identity_subject(&self.prefix, identity);
        let request = self.client.request(&subject, Bytes::new());
        match tokio::time::timeout(self.query_timeout, request).await {
            Ok(Ok(reply)) => Ok(reply.as_deref().is_some_and(decode_reply)),
            Ok(Err(e)) => Err(GatewayError::Bus(e.to_string())),
            Err(_) => {
                warn!("Presence request for {} timed out", identity);
                counter!("im_presence_timeouts_total").increment(1);
                Err(GatewayError::Bus(format!(
                    "presence request timed out after {:?}",
                    self.query_timeout
                )))
            }
        }
    }

    async fn advertise(&self, identity: &str, cancel: CancellationToken) -> Result<()> {
        let subject = identity_subject(&self.prefix, identity);
        let mut subscriber = self
            .client
            .subscribe(&subject)
            .await
            .map_err(|e| GatewayError::Bus(e.to_string()))?;

        let client = self.client.clone();
        let endpoints = self.endpoints.clone();
        let identity = identity.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    msg = subscriber.next() => {
                        let Some(msg) = msg else { break };
                        let Some(reply) = msg.reply else { continue };

                        let present = endpoints.is_online(&identity).await.unwrap_or(false);
                        if let Err(e) = client.publish_fast(&reply.to_string(), encode_reply(present)).await {
                            debug!("Presence reply for {} failed: {}", identity, e);
                        }
                    }
                }
            }

            if let Err(e) = subscriber.unsubscribe().await {
                debug!("Presence unsubscribe for {} failed: {}", subject, e);
            }
        });

        Ok(())
    }

    fn endpoints(&self) -> &Arc<EndpointRuntime> {
        &self.endpoints
    }
}

fn encode_reply(present: bool) -> Bytes {
    Bytes::from_static(if present { PRESENT } else { ABSENT })
}

fn decode_reply(payload: &[u8]) -> bool {
    payload == PRESENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_local_presence_tracks_sessions() {
        let presence = LocalPresence::new(Arc::new(EndpointRuntime::default()));
        let session = Uuid::new_v4();

        assert!(!presence.is_online("u1").await.unwrap());
        presence.online("u1", session).await.unwrap();
        assert!(presence.is_online("u1").await.unwrap());
        presence.offline("u1", session).await.unwrap();
        assert!(!presence.is_online("u1").await.unwrap());

        presence
            .advertise("u1", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(presence.endpoints().active_count(), 1);
    }

    #[test]
    fn test_reply_encoding() {
        assert!(decode_reply(&encode_reply(true)));
        assert!(!decode_reply(&encode_reply(false)));
        assert!(!decode_reply(b""));
    }

    #[test]
    fn test_presence_subject_is_separate_from_delivery() {
        assert_eq!(
            identity_subject(DEFAULT_PRESENCE_PREFIX, "user_42"),
            "im.presence.user_42"
        );
        assert_ne!(
            identity_subject(DEFAULT_PRESENCE_PREFIX, "u1"),
            identity_subject(crate::subscription::DEFAULT_SUBJECT_PREFIX, "u1")
        );
    }
}
