//! NATS core client used for per-identity delivery subjects.
//!
//! Delivery is at-most-once, so only core publish/subscribe and
//! request/reply are exposed here.

use anyhow::Result;
use async_nats::{Client, ConnectOptions, RequestErrorKind, Subscriber};
use bytes::Bytes;
use tracing::{debug, info};

/// Connection name reported to the NATS server.
pub const DEFAULT_CONNECTION_NAME: &str = "im-gateway";

/// Wrapper around the NATS client.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
}

impl NatsClient {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_named(url, DEFAULT_CONNECTION_NAME).await
    }

    /// Connect to a NATS server, announcing `name` as the connection name.
    pub async fn connect_named(url: &str, name: &str) -> Result<Self> {
        info!("Connecting to NATS at {} as '{}'", url, name);
        let client = ConnectOptions::new().name(name).connect(url).await?;
        Ok(Self { client })
    }

    /// Subscribe to a single subject using NATS Core (low-latency push).
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber> {
        debug!("Subscribing to subject: {}", subject);
        let subscriber = self.client.subscribe(subject.to_string()).await?;
        Ok(subscriber)
    }

    /// Publish a message using NATS Core (fire-and-forget).
    pub async fn publish_fast(&self, subject: &str, payload: Bytes) -> Result<()> {
        self.client.publish(subject.to_string(), payload).await?;
        Ok(())
    }

    /// Send a request and wait for the first reply.
    ///
    /// Returns `None` when the server reports no subscriber on `subject`.
    pub async fn request(&self, subject: &str, payload: Bytes) -> Result<Option<Bytes>> {
        match self.client.request(subject.to_string(), payload).await {
            Ok(msg) => Ok(Some(msg.payload)),
            Err(e) if matches!(e.kind(), RequestErrorKind::NoResponders) => {
                debug!("No responders on {}", subject);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Flush pending publishes to the server.
    pub async fn flush(&self) -> Result<()> {
        self.client.flush().await?;
        Ok(())
    }
}
