//! Routing service: recipient resolution and channel membership.
//!
//! Resolves a packet to its recipients (one identity, or a channel roster
//! minus the sender) and publishes one packet per recipient on the fanout
//! bus. Every membership store call is bounded by `store_timeout`.

use crate::error::RoutingError;
use crate::protocol::{Packet, SendType};
use crate::subscription::FanoutBus;
use membership_store::{MembershipStore, StoreError};
use metrics::counter;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub type RoutingResult<T> = std::result::Result<T, RoutingError>;

/// Configuration for the routing service.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Upper bound on any single membership store call.
    pub store_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// Routes packets to recipients and manages channel membership.
pub struct RoutingService {
    store: Arc<dyn MembershipStore>,
    bus: Arc<dyn FanoutBus>,
    config: RouterConfig,
}

impl RoutingService {
    /// Create a new routing service.
    pub fn new(
        store: Arc<dyn MembershipStore>,
        bus: Arc<dyn FanoutBus>,
        config: RouterConfig,
    ) -> Self {
        Self { store, bus, config }
    }

    pub fn bus(&self) -> &Arc<dyn FanoutBus> {
        &self.bus
    }

    // =========================================================================
    // Messaging
    // =========================================================================

    /// Route a packet by its delivery mode. Returns the number of publishes.
    pub async fn send(&self, packet: &Packet) -> RoutingResult<usize> {
        match packet.send_type {
            SendType::Direct => self.send_direct(packet).await,
            SendType::Broadcast => self.send_broadcast(packet).await,
        }
    }

    /// Publish once to `receiveId`. Succeeds whether or not anyone is listening.
    pub async fn send_direct(&self, packet: &Packet) -> RoutingResult<usize> {
        if packet.receive_id.is_empty() {
            return Err(RoutingError::InvalidRequest(
                "receiveId is required for direct messages".to_string(),
            ));
        }

        self.publish(&packet.receive_id, packet).await;
        Ok(1)
    }

    /// Publish to every roster member of `chanName` except the sender.
    ///
    /// A store failure aborts the broadcast before anything is published.
    pub async fn send_broadcast(&self, packet: &Packet) -> RoutingResult<usize> {
        if packet.chan_name.is_empty() {
            return Err(RoutingError::InvalidRequest(
                "chanName is required for broadcast messages".to_string(),
            ));
        }

        let members = self
            .bounded("channel_members", self.store.channel_members(&packet.chan_name))
            .await?;

        let mut published = 0;
        for member in members.iter().filter(|m| **m != packet.sender_id) {
            self.publish(member, &packet.addressed_to(member)).await;
            published += 1;
        }

        debug!(
            "Broadcast from {} to '{}' fanned out to {} recipients",
            packet.sender_id, packet.chan_name, published
        );
        Ok(published)
    }

    async fn publish(&self, recipient: &str, packet: &Packet) {
        match self.bus.publish(recipient, packet).await {
            Ok(()) => {
                counter!("im_packets_published_total").increment(1);
            }
            Err(e) => {
                warn!("Publish to {} failed: {}", recipient, e);
                counter!("im_publish_errors_total").increment(1);
            }
        }
    }

    // =========================================================================
    // Channels
    // =========================================================================

    /// Create `name` with `creator` as its only member.
    ///
    /// The roster and the creator's channel list are written together, so
    /// a failed call leaves neither behind.
    pub async fn create_channel(&self, name: &str, creator: &str) -> RoutingResult<()> {
        require("chanName", name)?;
        require("clientId", creator)?;

        if !self
            .bounded("create_channel", self.store.create_channel(name, creator))
            .await?
        {
            return Err(RoutingError::DuplicateChannel(name.to_string()));
        }

        info!("Channel '{}' created by {}", name, creator);
        Ok(())
    }

    /// Add `identity` to an existing channel.
    pub async fn join_channel(&self, name: &str, identity: &str) -> RoutingResult<()> {
        require("chanName", name)?;
        require("clientId", identity)?;

        if !self
            .bounded("join_channel", self.store.join_channel(name, identity))
            .await?
        {
            return Err(RoutingError::ChannelNotFound(name.to_string()));
        }

        info!("{} joined channel '{}'", identity, name);
        Ok(())
    }

    /// Remove `identity` from the channel roster and its channel list.
    pub async fn leave_channel(&self, name: &str, identity: &str) -> RoutingResult<()> {
        require("chanName", name)?;
        require("clientId", identity)?;

        if !self
            .bounded("leave_channel", self.store.leave_channel(name, identity))
            .await?
        {
            return Err(RoutingError::NotAMember {
                channel: name.to_string(),
                identity: identity.to_string(),
            });
        }

        info!("{} left channel '{}'", identity, name);
        Ok(())
    }

    pub async fn user_channels(&self, identity: &str) -> RoutingResult<Vec<String>> {
        require("clientId", identity)?;
        self.bounded("user_channels", self.store.user_channels(identity))
            .await
    }

    // =========================================================================
    // Friends
    // =========================================================================

    pub async fn add_friend(&self, identity: &str, friend: &str) -> RoutingResult<()> {
        require("clientId", identity)?;
        require("friendId", friend)?;
        self.bounded("add_friend", self.store.add_friend(identity, friend))
            .await
    }

    /// Returns whether `friend` was on the list.
    pub async fn remove_friend(&self, identity: &str, friend: &str) -> RoutingResult<bool> {
        require("clientId", identity)?;
        require("friendId", friend)?;
        self.bounded("remove_friend", self.store.remove_friend(identity, friend))
            .await
    }

    pub async fn user_friends(&self, identity: &str) -> RoutingResult<Vec<String>> {
        require("clientId", identity)?;
        self.bounded("friends", self.store.friends(identity)).await
    }

    // =========================================================================
    // Online Counter
    // =========================================================================

    pub async fn record_online(&self) -> RoutingResult<i64> {
        self.bounded("incr_online", self.store.incr_online()).await
    }

    pub async fn record_offline(&self) -> RoutingResult<i64> {
        self.bounded("decr_online", self.store.decr_online()).await
    }

    pub async fn online_count(&self) -> RoutingResult<i64> {
        self.bounded("online_count", self.store.online_count()).await
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = membership_store::Result<T>>,
    ) -> RoutingResult<T> {
        let err = match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => StoreError::Timeout(self.config.store_timeout),
        };

        warn!("Store call {} failed: {}", op, err);
        counter!("im_store_errors_total").increment(1);
        Err(RoutingError::Store(err))
    }
}

fn require(field: &str, value: &str) -> RoutingResult<()> {
    if value.is_empty() {
        return Err(RoutingError::InvalidRequest(format!("{} is required", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, Result};
    use crate::subscription::Subscription;
    use async_trait::async_trait;
    use membership_store::InMemoryMembershipStore;
    use std::sync::Mutex;

    /// Records every publish instead of delivering it.
    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, Packet)>>,
        fail: bool,
    }

    impl RecordingBus {
        fn recipients(&self) -> Vec<String> {
            let mut ids: Vec<String> = self
                .published
                .lock()
                .unwrap()
                .iter()
                .map(|(id, _)| id.clone())
                .collect();
            ids.sort();
            ids
        }
    }

    #[async_trait]
    impl FanoutBus for RecordingBus {
        async fn publish(&self, identity: &str, packet: &Packet) -> Result<()> {
            if self.fail {
                return Err(GatewayError::Bus("bus down".to_string()));
            }
            self.published
                .lock()
                .unwrap()
                .push((identity.to_string(), packet.clone()));
            Ok(())
        }

        async fn subscribe(&self, _identity: &str) -> Result<Subscription> {
            Err(GatewayError::Bus("not supported".to_string()))
        }
    }

    /// Store whose every call outlives any reasonable timeout.
    struct StalledStore;

    impl StalledStore {
        async fn stall(&self) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
    }

    #[async_trait]
    impl MembershipStore for StalledStore {
        async fn create_channel(&self, _: &str, _: &str) -> membership_store::Result<bool> {
            self.stall().await;
            Ok(true)
        }
        async fn channel_exists(&self, _: &str) -> membership_store::Result<bool> {
            self.stall().await;
            Ok(true)
        }
        async fn join_channel(&self, _: &str, _: &str) -> membership_store::Result<bool> {
            self.stall().await;
            Ok(true)
        }
        async fn leave_channel(&self, _: &str, _: &str) -> membership_store::Result<bool> {
            self.stall().await;
            Ok(true)
        }
        async fn channel_members(&self, _: &str) -> membership_store::Result<Vec<String>> {
            self.stall().await;
            Ok(vec![])
        }
        async fn user_channels(&self, _: &str) -> membership_store::Result<Vec<String>> {
            self.stall().await;
            Ok(vec![])
        }
        async fn add_friend(&self, _: &str, _: &str) -> membership_store::Result<()> {
            self.stall().await;
            Ok(())
        }
        async fn remove_friend(&self, _: &str, _: &str) -> membership_store::Result<bool> {
            self.stall().await;
            Ok(true)
        }
        async fn friends(&self, _: &str) -> membership_store::Result<Vec<String>> {
            self.stall().await;
            Ok(vec![])
        }
        async fn incr_online(&self) -> membership_store::Result<i64> {
            self.stall().await;
            Ok(1)
        }
        async fn decr_online(&self) -> membership_store::Result<i64> {
            self.stall().await;
            Ok(0)
        }
        async fn online_count(&self) -> membership_store::Result<i64> {
            self.stall().await;
            Ok(0)
        }
    }

    fn make_service() -> (RoutingService, Arc<InMemoryMembershipStore>, Arc<RecordingBus>) {
        let store = Arc::new(InMemoryMembershipStore::new());
        let bus = Arc::new(RecordingBus::default());
        let service = RoutingService::new(store.clone(), bus.clone(), RouterConfig::default());
        (service, store, bus)
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let (service, _store, bus) = make_service();
        service.create_channel("room1", "u1").await.unwrap();
        service.join_channel("room1", "u2").await.unwrap();
        service.join_channel("room1", "u3").await.unwrap();

        let sent = service
            .send(&Packet::broadcast("u1", "room1", "hi"))
            .await
            .unwrap();

        assert_eq!(sent, 2);
        assert_eq!(bus.recipients(), vec!["u2", "u3"]);

        for (recipient, packet) in bus.published.lock().unwrap().iter() {
            assert_eq!(&packet.receive_id, recipient);
            assert_eq!(packet.sender_id, "u1");
            assert_eq!(packet.content, "hi");
        }
    }

    #[tokio::test]
    async fn test_broadcast_from_non_member_reaches_everyone() {
        let (service, _store, bus) = make_service();
        service.create_channel("room1", "u1").await.unwrap();
        service.join_channel("room1", "u2").await.unwrap();

        let sent = service
            .send_broadcast(&Packet::broadcast("admin", "room1", "notice"))
            .await
            .unwrap();

        assert_eq!(sent, 2);
        assert_eq!(bus.recipients(), vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_channel_publishes_nothing() {
        let (service, _store, bus) = make_service();
        let sent = service
            .send_broadcast(&Packet::broadcast("u1", "ghost", "hi"))
            .await
            .unwrap();
        assert_eq!(sent, 0);
        assert!(bus.recipients().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_channel_rejected() {
        let (service, store, _bus) = make_service();
        service.create_channel("room1", "u1").await.unwrap();

        let err = service.create_channel("room1", "u2").await.unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateChannel(ref name) if name == "room1"));
        assert_eq!(store.channel_members("room1").await.unwrap(), vec!["u1"]);
        assert!(store.user_channels("u2").await.unwrap().is_empty());
        assert_eq!(service.user_channels("u1").await.unwrap(), vec!["room1"]);
    }

    #[tokio::test]
    async fn test_join_missing_channel_fails() {
        let (service, store, _bus) = make_service();
        let err = service.join_channel("nope", "u1").await.unwrap_err();
        assert!(matches!(err, RoutingError::ChannelNotFound(_)));
        assert!(!store.channel_exists("nope").await.unwrap());
        assert!(store.user_channels("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leave_by_non_member_fails() {
        let (service, store, _bus) = make_service();
        service.create_channel("room1", "u1").await.unwrap();
        service.join_channel("room1", "u2").await.unwrap();

        let err = service.leave_channel("room1", "u4").await.unwrap_err();
        assert!(matches!(err, RoutingError::NotAMember { .. }));
        assert_eq!(
            store.channel_members("room1").await.unwrap(),
            vec!["u1", "u2"]
        );

        service.leave_channel("room1", "u2").await.unwrap();
        assert_eq!(store.channel_members("room1").await.unwrap(), vec!["u1"]);
        assert!(service.user_channels("u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_emptied_channel_stays_joinable() {
        let (service, store, bus) = make_service();
        service.create_channel("room1", "u1").await.unwrap();
        service.leave_channel("room1", "u1").await.unwrap();

        assert!(store.channel_exists("room1").await.unwrap());
        assert_eq!(
            service.send_broadcast(&Packet::broadcast("u1", "room1", "echo")).await.unwrap(),
            0
        );

        service.join_channel("room1", "u2").await.unwrap();
        let err = service.create_channel("room1", "u9").await.unwrap_err();
        assert!(matches!(err, RoutingError::DuplicateChannel(_)));
        assert!(service.user_channels("u9").await.unwrap().is_empty());

        service
            .send_broadcast(&Packet::broadcast("u1", "room1", "hi"))
            .await
            .unwrap();
        assert_eq!(bus.recipients(), vec!["u2"]);
    }

    #[tokio::test]
    async fn test_direct_succeeds_without_subscriber_or_bus() {
        let store = Arc::new(InMemoryMembershipStore::new());
        let bus = Arc::new(RecordingBus {
            fail: true,
            ..Default::default()
        });
        let service = RoutingService::new(store, bus, RouterConfig::default());

        let sent = service
            .send(&Packet::direct("u1", "offline-user", "hi"))
            .await
            .unwrap();
        assert_eq!(sent, 1);
    }

    #[tokio::test]
    async fn test_direct_requires_recipient() {
        let (service, _store, _bus) = make_service();
        let err = service
            .send(&Packet::direct("u1", "", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_friend_list() {
        let (service, _store, _bus) = make_service();
        service.add_friend("u1", "u2").await.unwrap();
        service.add_friend("u1", "u3").await.unwrap();
        assert!(service.remove_friend("u1", "u3").await.unwrap());
        assert_eq!(service.user_friends("u1").await.unwrap(), vec!["u2"]);
        assert!(matches!(
            service.add_friend("u1", "").await,
            Err(RoutingError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_store_calls_time_out() {
        let bus = Arc::new(RecordingBus::default());
        let service = RoutingService::new(
            Arc::new(StalledStore),
            bus.clone(),
            RouterConfig {
                store_timeout: Duration::from_millis(50),
            },
        );

        let err = service
            .send_broadcast(&Packet::broadcast("u1", "room1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Store(StoreError::Timeout(_))));
        assert!(bus.recipients().is_empty());

        assert!(matches!(
            service.create_channel("room1", "u1").await,
            Err(RoutingError::Store(_))
        ));

        // Direct delivery never touches the store.
        assert_eq!(
            service.send(&Packet::direct("u1", "u2", "hi")).await.unwrap(),
            1
        );
    }
}
