//! Block list and skip cooldowns consulted by the matcher
//!
//! A block is permanent for the lifetime of the process and applies in both
//! directions. A skip puts the pair on cooldown so the same two users are not
//! immediately rematched.

use crate::error::{ChatError, Result};
use crate::types::UserId;
use crate::utils::pair_key;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info};

/// Pair restrictions applied on top of the compatibility predicate
#[derive(Debug)]
pub struct Moderation {
    blocks: RwLock<HashSet<(UserId, UserId)>>,
    cooldowns: RwLock<HashMap<(UserId, UserId), DateTime<Utc>>>,
    skip_cooldown: Duration,
}

impl Moderation {
    pub fn new(skip_cooldown: std::time::Duration) -> Self {
        Self {
            blocks: RwLock::new(HashSet::new()),
            cooldowns: RwLock::new(HashMap::new()),
            skip_cooldown: Duration::from_std(skip_cooldown).unwrap_or(Duration::hours(1)),
        }
    }

    /// Record that `blocker` never wants to see `blocked` again
    pub fn block(&self, blocker: &str, blocked: &str) -> Result<()> {
        let mut blocks = self.blocks.write().map_err(|_| ChatError::lock("blocks"))?;
        if blocks.insert((blocker.to_string(), blocked.to_string())) {
            info!("User {} blocked {}", blocker, blocked);
        }
        Ok(())
    }

    /// Whether either user has blocked the other
    pub fn is_blocked_pair(&self, a: &str, b: &str) -> bool {
        let Ok(blocks) = self.blocks.read() else {
            return false;
        };
        blocks.contains(&(a.to_string(), b.to_string()))
            || blocks.contains(&(b.to_string(), a.to_string()))
    }

    /// Start the skip cooldown for a pair
    pub fn record_skip(&self, a: &str, b: &str) -> Result<()> {
        let until = Utc::now() + self.skip_cooldown;
        self.cooldowns
            .write()
            .map_err(|_| ChatError::lock("cooldowns"))?
            .insert(pair_key(a, b), until);
        debug!("Pair {}/{} on cooldown until {}", a, b, until);
        Ok(())
    }

    pub fn on_cooldown(&self, a: &str, b: &str) -> bool {
        let Ok(cooldowns) = self.cooldowns.read() else {
            return false;
        };
        cooldowns
            .get(&pair_key(a, b))
            .is_some_and(|until| *until > Utc::now())
    }

    /// Whether the pair may be matched at all
    pub fn allows(&self, a: &str, b: &str) -> bool {
        !self.is_blocked_pair(a, b) && !self.on_cooldown(a, b)
    }

    /// Drop expired cooldown entries, returning how many were removed
    pub fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut cooldowns = self
            .cooldowns
            .write()
            .map_err(|_| ChatError::lock("cooldowns"))?;
        let before = cooldowns.len();
        cooldowns.retain(|_, until| *until > now);
        Ok(before - cooldowns.len())
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().map(|b| b.len()).unwrap_or(0)
    }
}

impl Default for Moderation {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(3600))
    }
}
