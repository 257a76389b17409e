//! Per-user rate limits on client actions
//!
//! Token buckets keyed by user and action class. A bucket holds `capacity`
//! tokens and refills them evenly over `per`.

use crate::error::{ChatError, Result};
use crate::types::UserId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Action classes that share a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitedAction {
    /// START_SEARCH and CANCEL_SEARCH
    Search,
    /// SEND_MESSAGE
    Message,
}

impl LimitedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitedAction::Search => "search",
            LimitedAction::Message => "message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub capacity: u32,
    pub per: Duration,
}

impl RateLimit {
    pub fn per_minute(capacity: u32) -> Self {
        Self {
            capacity,
            per: Duration::from_secs(60),
        }
    }

    /// Time to earn back one token
    fn refill_interval(&self) -> Duration {
        self.per / self.capacity.max(1)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    refreshed: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    search: Option<RateLimit>,
    message: Option<RateLimit>,
    buckets: Mutex<HashMap<(UserId, LimitedAction), Bucket>>,
}

impl RateLimiter {
    /// A limit of `None` (or zero capacity) leaves that action unlimited
    pub fn new(search: Option<RateLimit>, message: Option<RateLimit>) -> Self {
        let usable = |limit: Option<RateLimit>| limit.filter(|l| l.capacity > 0 && !l.per.is_zero());
        Self {
            search: usable(search),
            message: usable(message),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None, None)
    }

    fn limit_for(&self, action: LimitedAction) -> Option<RateLimit> {
        match action {
            LimitedAction::Search => self.search,
            LimitedAction::Message => self.message,
        }
    }

    /// Take one token for `action`, failing with `RateLimited` when the bucket is empty
    pub fn check(&self, user_id: &str, action: LimitedAction) -> Result<()> {
        let Some(limit) = self.limit_for(action) else {
            return Ok(());
        };
        let capacity = f64::from(limit.capacity);
        let now = Instant::now();

        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| ChatError::lock("rate limiter"))?;
        let bucket = buckets
            .entry((user_id.to_string(), action))
            .or_insert(Bucket {
                tokens: capacity,
                refreshed: now,
            });

        let earned = now.duration_since(bucket.refreshed).as_secs_f64()
            / limit.refill_interval().as_secs_f64();
        bucket.tokens = (bucket.tokens + earned).min(capacity);
        bucket.refreshed = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let missing = 1.0 - bucket.tokens;
        let retry_after = limit.refill_interval().mul_f64(missing);
        debug!("{} is over the {} rate limit", user_id, action.as_str());
        Err(ChatError::RateLimited {
            action: action.as_str(),
            retry_after_ms: retry_after.as_millis() as u64,
        }
        .into())
    }

    /// Drop buckets that have refilled completely
    pub fn prune(&self) -> Result<usize> {
        let now = Instant::now();
        let mut buckets = self
            .buckets
            .lock()
            .map_err(|_| ChatError::lock("rate limiter"))?;
        let before = buckets.len();
        buckets.retain(|(_, action), bucket| {
            let limit = match action {
                LimitedAction::Search => self.search,
                LimitedAction::Message => self.message,
            };
            limit.is_some_and(|limit| now.duration_since(bucket.refreshed) < limit.per)
        });
        Ok(before - buckets.len())
    }
}
