//! Presence tracking
//!
//! A user is online while it holds a live handle on this instance or while
//! another instance reports it online. Offline signals are keyed by the handle
//! (or instance) that produced them so a stale disconnect cannot take down a
//! newer connection.

use crate::error::{ChatError, Result};
use crate::types::{ConnectionId, InstanceId, UserId};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::debug;

/// A user's online state flipped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub online: bool,
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    local: RwLock<HashMap<UserId, ConnectionId>>,
    remote: RwLock<HashMap<UserId, InstanceId>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live handle; reports a change if the user was offline before
    pub fn mark_online(&self, user_id: &str, handle: ConnectionId) -> Result<Option<PresenceChange>> {
        // Locks are always taken local first, then remote.
        let mut local = self.local.write().map_err(|_| ChatError::lock("presence"))?;
        let remote = self.remote.read().map_err(|_| ChatError::lock("presence"))?;
        let was_online = local.contains_key(user_id) || remote.contains_key(user_id);
        local.insert(user_id.to_string(), handle);

        Ok((!was_online).then(|| PresenceChange {
            user_id: user_id.to_string(),
            online: true,
        }))
    }

    /// Drop a handle; ignored unless `handle` is the user's current one
    pub fn mark_offline(&self, user_id: &str, handle: ConnectionId) -> Result<Option<PresenceChange>> {
        let mut local = self.local.write().map_err(|_| ChatError::lock("presence"))?;
        match local.get(user_id) {
            Some(current) if *current == handle => {
                local.remove(user_id);
            }
            Some(_) => {
                debug!("Ignoring stale offline signal for {}", user_id);
                return Ok(None);
            }
            None => return Ok(None),
        }

        let remote = self.remote.read().map_err(|_| ChatError::lock("presence"))?;
        Ok((!remote.contains_key(user_id)).then(|| PresenceChange {
            user_id: user_id.to_string(),
            online: false,
        }))
    }

    /// Apply a presence report from another instance
    pub fn apply_remote(
        &self,
        user_id: &str,
        instance: InstanceId,
        online: bool,
    ) -> Result<Option<PresenceChange>> {
        let local = self.local.read().map_err(|_| ChatError::lock("presence"))?;
        let mut remote = self.remote.write().map_err(|_| ChatError::lock("presence"))?;
        let was_online = local.contains_key(user_id) || remote.contains_key(user_id);
        if online {
            remote.insert(user_id.to_string(), instance);
        } else if remote.get(user_id) == Some(&instance) {
            remote.remove(user_id);
        }

        let now_online = local.contains_key(user_id) || remote.contains_key(user_id);
        Ok((was_online != now_online).then(|| PresenceChange {
            user_id: user_id.to_string(),
            online: now_online,
        }))
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        let local = self
            .local
            .read()
            .map(|l| l.contains_key(user_id))
            .unwrap_or(false);
        local
            || self
                .remote
                .read()
                .map(|r| r.contains_key(user_id))
                .unwrap_or(false)
    }

    /// Whether the user is connected to this very instance
    pub fn is_local(&self, user_id: &str) -> bool {
        self.local
            .read()
            .map(|l| l.contains_key(user_id))
            .unwrap_or(false)
    }

    pub fn online_users(&self) -> HashSet<UserId> {
        let mut users: HashSet<UserId> = self
            .local
            .read()
            .map(|l| l.keys().cloned().collect())
            .unwrap_or_default();
        if let Ok(remote) = self.remote.read() {
            users.extend(remote.keys().cloned());
        }
        users
    }

    pub fn local_count(&self) -> usize {
        self.local.read().map(|l| l.len()).unwrap_or(0)
    }
}
