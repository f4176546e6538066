//! Redis-backed membership store.

use crate::error::Result;
use crate::{
    friend_key, user_channels_key, MembershipStore, CHANNEL_REGISTRY_KEY, ONLINE_COUNTER_KEY,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

/// KEYS: registry, roster, creator's channel list. ARGV: channel, creator.
///
/// A roster key that predates the registry also counts as taken.
const CREATE_CHANNEL_SCRIPT: &str = r#"
if KEYS[1] == KEYS[2] or redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1
    or redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[2], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[1])
return 1
"#;

/// KEYS: registry, roster, member's channel list. ARGV: channel, member.
const JOIN_CHANNEL_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0
    and redis.call('EXISTS', KEYS[2]) == 0 then
    return 0
end
redis.call('HSET', KEYS[2], ARGV[2], ARGV[2])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[1])
return 1
"#;

/// KEYS: roster, member's channel list. ARGV: channel, member.
const LEAVE_CHANNEL_SCRIPT: &str = r#"
if redis.call('HDEL', KEYS[1], ARGV[2]) == 0 then
    return 0
end
redis.call('HDEL', KEYS[2], ARGV[1])
return 1
"#;

/// Membership store over one shared, self-reconnecting Redis connection.
///
/// The connection is established once at startup; every call works on a
/// clone of the same multiplexed manager.
#[derive(Clone)]
pub struct RedisMembershipStore {
    conn: ConnectionManager,
    create_script: Script,
    join_script: Script,
    leave_script: Script,
}

impl RedisMembershipStore {
    /// Connect to `redis_url` and build the shared connection.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis at {}", redis_url);
        Ok(Self {
            conn,
            create_script: Script::new(CREATE_CHANNEL_SCRIPT),
            join_script: Script::new(JOIN_CHANNEL_SCRIPT),
            leave_script: Script::new(LEAVE_CHANNEL_SCRIPT),
        })
    }

    /// Handle on the shared connection.
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn hash_set(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.connection();
        conn.hset::<_, _, _, ()>(key, field, field).await?;
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.connection();
        let removed: i64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hash_fields(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let fields: Vec<String> = conn.hkeys(key).await?;
        Ok(fields)
    }
}

#[async_trait]
impl MembershipStore for RedisMembershipStore {
    // =========================================================================
    // Channel Rosters
    // =========================================================================

    async fn create_channel(&self, channel: &str, creator: &str) -> Result<bool> {
        let mut conn = self.connection();
        let created: i64 = self
            .create_script
            .key(CHANNEL_REGISTRY_KEY)
            .key(channel)
            .key(user_channels_key(creator))
            .arg(channel)
            .arg(creator)
            .invoke_async(&mut conn)
            .await?;
        debug!("create_channel '{}' by {} -> {}", channel, creator, created);
        Ok(created == 1)
    }

    async fn channel_exists(&self, channel: &str) -> Result<bool> {
        let mut conn = self.connection();
        let registered: bool = conn.hexists(CHANNEL_REGISTRY_KEY, channel).await?;
        if registered {
            return Ok(true);
        }
        let exists: bool = conn.exists(channel).await?;
        Ok(exists)
    }

    async fn join_channel(&self, channel: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection();
        let joined: i64 = self
            .join_script
            .key(CHANNEL_REGISTRY_KEY)
            .key(channel)
            .key(user_channels_key(member))
            .arg(channel)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(joined == 1)
    }

    async fn leave_channel(&self, channel: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection();
        let left: i64 = self
            .leave_script
            .key(channel)
            .key(user_channels_key(member))
            .arg(channel)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(left == 1)
    }

    async fn channel_members(&self, channel: &str) -> Result<Vec<String>> {
        self.hash_fields(channel).await
    }

    // =========================================================================
    // Per-user Lists
    // =========================================================================

    async fn user_channels(&self, identity: &str) -> Result<Vec<String>> {
        self.hash_fields(&user_channels_key(identity)).await
    }

    async fn add_friend(&self, identity: &str, friend: &str) -> Result<()> {
        self.hash_set(&friend_key(identity), friend).await
    }

    async fn remove_friend(&self, identity: &str, friend: &str) -> Result<bool> {
        self.hash_delete(&friend_key(identity), friend).await
    }

    async fn friends(&self, identity: &str) -> Result<Vec<String>> {
        self.hash_fields(&friend_key(identity)).await
    }

    // =========================================================================
    // Online Counter
    // =========================================================================

    async fn incr_online(&self) -> Result<i64> {
        let mut conn = self.connection();
        let value: i64 = conn.incr(ONLINE_COUNTER_KEY, 1).await?;
        Ok(value)
    }

    async fn decr_online(&self) -> Result<i64> {
        let mut conn = self.connection();
        let value: i64 = conn.decr(ONLINE_COUNTER_KEY, 1).await?;
        Ok(value)
    }

    async fn online_count(&self) -> Result<i64> {
        let mut conn = self.connection();
        let value: Option<i64> = conn.get(ONLINE_COUNTER_KEY).await?;
        Ok(value.unwrap_or(0))
    }
}
