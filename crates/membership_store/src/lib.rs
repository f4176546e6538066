//! Membership storage for channels, friend lists and the online counter.
//!
//! All state lives behind the [`MembershipStore`] trait. Two implementations
//! are provided:
//! - [`RedisMembershipStore`]: hashes and counters in Redis
//! - [`InMemoryMembershipStore`]: the same hash semantics in process, for
//!   single-node runs and tests
//!
//! # Key layout
//!
//! ```text
//! friend_<identity>   hash  friendId    -> friendId
//! chan_<identity>     hash  channelName -> channelName
//! <channelName>       hash  memberId    -> memberId
//! wsim_channels       hash  channelName -> creatorId
//! wsim_online         int   live session count
//! ```
//!
//! A channel exists once it is recorded in `wsim_channels` and is never
//! removed from it, so an empty roster still names a live channel.

pub mod error;
pub mod memory;
pub mod redis_store;

pub use error::{Result, StoreError};
pub use memory::InMemoryMembershipStore;
pub use redis_store::RedisMembershipStore;

use async_trait::async_trait;

/// Key prefix for a user's friend hash: friend_{identity}
pub const FRIEND_KEY_PREFIX: &str = "friend_";

/// Key prefix for a user's channel hash: chan_{identity}
pub const CHAN_KEY_PREFIX: &str = "chan_";

/// Key of the channel registry hash.
pub const CHANNEL_REGISTRY_KEY: &str = "wsim_channels";

/// Key holding the global online counter.
pub const ONLINE_COUNTER_KEY: &str = "wsim_online";

/// Key of the hash listing `identity`'s friends.
pub fn friend_key(identity: &str) -> String {
    format!("{}{}", FRIEND_KEY_PREFIX, identity)
}

/// Key of the hash listing the channels `identity` belongs to.
pub fn user_channels_key(identity: &str) -> String {
    format!("{}{}", CHAN_KEY_PREFIX, identity)
}

/// Persistent membership and presence-counter operations.
///
/// Channel rosters are keyed by the bare channel name. Each roster change
/// updates the member's own channel list in the same atomic step.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Create `channel` with `creator` as its only member and record it in
    /// the creator's channel list.
    /// Returns `false` without touching anything if the channel already exists.
    async fn create_channel(&self, channel: &str, creator: &str) -> Result<bool>;

    /// Whether `channel` was ever created. Emptied channels still exist.
    async fn channel_exists(&self, channel: &str) -> Result<bool>;

    /// Add `member` to an existing channel and to the member's channel list.
    /// Returns `false` if the channel is missing.
    async fn join_channel(&self, channel: &str, member: &str) -> Result<bool>;

    /// Remove `member` from the roster and from the member's channel list.
    /// Returns `false` if it was not a member.
    async fn leave_channel(&self, channel: &str, member: &str) -> Result<bool>;

    /// Current roster of `channel` (empty if the channel does not exist).
    async fn channel_members(&self, channel: &str) -> Result<Vec<String>>;

    async fn user_channels(&self, identity: &str) -> Result<Vec<String>>;

    async fn add_friend(&self, identity: &str, friend: &str) -> Result<()>;

    async fn remove_friend(&self, identity: &str, friend: &str) -> Result<bool>;

    async fn friends(&self, identity: &str) -> Result<Vec<String>>;

    /// Increment the online counter, returning the new value.
    async fn incr_online(&self) -> Result<i64>;

    /// Decrement the online counter, returning the new value.
    async fn decr_online(&self) -> Result<i64>;

    async fn online_count(&self) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(FRIEND_KEY_PREFIX, "friend_");
        assert_eq!(CHAN_KEY_PREFIX, "chan_");
        assert_eq!(ONLINE_COUNTER_KEY, "wsim_online");
        assert_eq!(CHANNEL_REGISTRY_KEY, "wsim_channels");
        assert_eq!(friend_key("u1"), "friend_u1");
        assert_eq!(user_channels_key("u1"), "chan_u1");
    }
}
