//! In-process membership store with Redis hash semantics.
//!
//! Uses lock-free DashMap so rosters can be read and mutated concurrently
//! from many sessions.

use crate::error::Result;
use crate::{friend_key, user_channels_key, MembershipStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};

/// Per-user hashes, channel rosters and the online counter.
///
/// Roster operations hold the channel's entry while they update the member's
/// channel list, so the two never disagree.
#[derive(Default)]
pub struct InMemoryMembershipStore {
    /// Key → hash fields (field and value are always equal).
    hashes: DashMap<String, BTreeSet<String>>,
    /// Channel name → roster. Entries are never removed.
    channels: DashMap<String, BTreeSet<String>>,
    online: AtomicI64,
}

impl InMemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn hash_set(&self, key: String, field: &str) {
        self.hashes.entry(key).or_default().insert(field.to_string());
    }

    fn hash_delete(&self, key: &str, field: &str) -> bool {
        let removed = match self.hashes.get_mut(key) {
            Some(mut fields) => fields.remove(field),
            None => return false,
        };
        // Redis drops a hash once its last field is gone.
        self.hashes.remove_if(key, |_, fields| fields.is_empty());
        removed
    }

    fn hash_fields(&self, key: &str) -> Vec<String> {
        self.hashes
            .get(key)
            .map(|fields| fields.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of channels ever created.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembershipStore {
    async fn create_channel(&self, channel: &str, creator: &str) -> Result<bool> {
        match self.channels.entry(channel.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let _roster = slot.insert(BTreeSet::from([creator.to_string()]));
                self.hash_set(user_channels_key(creator), channel);
                Ok(true)
            }
        }
    }

    async fn channel_exists(&self, channel: &str) -> Result<bool> {
        Ok(self.channels.contains_key(channel))
    }

    async fn join_channel(&self, channel: &str, member: &str) -> Result<bool> {
        match self.channels.get_mut(channel) {
            Some(mut roster) => {
                roster.insert(member.to_string());
                self.hash_set(user_channels_key(member), channel);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn leave_channel(&self, channel: &str, member: &str) -> Result<bool> {
        let Some(mut roster) = self.channels.get_mut(channel) else {
            return Ok(false);
        };
        if !roster.remove(member) {
            return Ok(false);
        }
        self.hash_delete(&user_channels_key(member), channel);
        Ok(true)
    }

    async fn channel_members(&self, channel: &str) -> Result<Vec<String>> {
        Ok(self
            .channels
            .get(channel)
            .map(|roster| roster.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn user_channels(&self, identity: &str) -> Result<Vec<String>> {
        Ok(self.hash_fields(&user_channels_key(identity)))
    }

    async fn add_friend(&self, identity: &str, friend: &str) -> Result<()> {
        self.hash_set(friend_key(identity), friend);
        Ok(())
    }

    async fn remove_friend(&self, identity: &str, friend: &str) -> Result<bool> {
        Ok(self.hash_delete(&friend_key(identity), friend))
    }

    async fn friends(&self, identity: &str) -> Result<Vec<String>> {
        Ok(self.hash_fields(&friend_key(identity)))
    }

    async fn incr_online(&self) -> Result<i64> {
        Ok(self.online.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn decr_online(&self) -> Result<i64> {
        Ok(self.online.fetch_sub(1, Ordering::SeqCst) - 1)
    }

    async fn online_count(&self) -> Result<i64> {
        Ok(self.online.load(Ordering::SeqCst))
    }
}
