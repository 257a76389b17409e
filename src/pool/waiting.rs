//! The waiting pool of users seeking a partner
//!
//! Records are bucketed by mode and ordered by `(enqueued_at, sequence)` inside each
//! bucket, so a scan visits candidates in FIFO order and never looks at users that
//! could not match on mode anyway. All compound operations run inside one critical
//! section; callers never get a "check" they have to follow with a separate "act".

use crate::error::{ChatError, Result};
use crate::types::{ChatMode, PreferenceRecord, UserId};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, error};

type OrderKey = (DateTime<Utc>, u64);

#[derive(Debug, Clone)]
struct PoolEntry {
    record: PreferenceRecord,
    seq: u64,
}

impl PoolEntry {
    fn order_key(&self) -> OrderKey {
        (self.record.enqueued_at, self.seq)
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    entries: HashMap<UserId, PoolEntry>,
    buckets: HashMap<ChatMode, BTreeMap<OrderKey, UserId>>,
    claimed: HashSet<UserId>,
    next_seq: u64,
}

impl PoolInner {
    fn insert(&mut self, entry: PoolEntry) {
        self.buckets
            .entry(entry.record.mode)
            .or_default()
            .insert(entry.order_key(), entry.record.user_id.clone());
        self.entries.insert(entry.record.user_id.clone(), entry);
    }

    fn take(&mut self, user_id: &str) -> Option<PoolEntry> {
        let entry = self.entries.remove(user_id)?;
        if let Some(bucket) = self.buckets.get_mut(&entry.record.mode) {
            bucket.remove(&entry.order_key());
        }
        Some(entry)
    }

    fn find_candidate<F>(&self, requester: &PreferenceRecord, compatible: F) -> Option<&PoolEntry>
    where
        F: Fn(&PreferenceRecord, &PreferenceRecord) -> bool,
    {
        let bucket = self.buckets.get(&requester.mode)?;
        bucket
            .values()
            .filter(|user_id| user_id.as_str() != requester.user_id)
            .filter_map(|user_id| self.entries.get(user_id))
            .find(|entry| compatible(requester, &entry.record))
    }
}

/// Outcome of removing a user from the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// The user was waiting and has been removed
    Removed(PreferenceRecord),
    /// The user was not in the pool
    Absent,
    /// The user has already been claimed by a match in flight
    Claimed,
}

/// Two records taken out of the pool together
///
/// Both users stay marked as claimed until the pair is either released (room
/// opened) or restored (room creation failed).
#[derive(Debug, Clone)]
pub struct ClaimedPair {
    pub requester: PreferenceRecord,
    pub candidate: PreferenceRecord,
    seqs: (u64, u64),
}

impl ClaimedPair {
    pub fn user_ids(&self) -> (&UserId, &UserId) {
        (&self.requester.user_id, &self.candidate.user_id)
    }
}

/// Ordered collection of preference records awaiting a partner
#[derive(Debug, Default)]
pub struct WaitingPool {
    inner: Mutex<PoolInner>,
}

impl WaitingPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PoolInner>> {
        self.inner
            .lock()
            .map_err(|_| ChatError::lock("waiting pool").into())
    }

    /// Insert a record; fails with `AlreadyQueued` if the user is waiting or claimed
    pub fn enqueue(&self, record: PreferenceRecord) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.entries.contains_key(&record.user_id) || inner.claimed.contains(&record.user_id)
        {
            return Err(ChatError::AlreadyQueued {
                user_id: record.user_id,
            }
            .into());
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        debug!(
            "Enqueued {} (mode {}, seq {})",
            record.user_id, record.mode, seq
        );
        inner.insert(PoolEntry { record, seq });
        Ok(())
    }

    /// Remove a waiting user. Idempotent: an absent user is not an error.
    pub fn remove(&self, user_id: &str) -> Result<RemoveOutcome> {
        let mut inner = self.lock()?;
        if let Some(entry) = inner.take(user_id) {
            return Ok(RemoveOutcome::Removed(entry.record));
        }
        if inner.claimed.contains(user_id) {
            return Ok(RemoveOutcome::Claimed);
        }
        Ok(RemoveOutcome::Absent)
    }

    /// Earliest-enqueued compatible candidate for `record`, excluding the requester
    pub fn scan_compatible<F>(
        &self,
        record: &PreferenceRecord,
        compatible: F,
    ) -> Result<Option<PreferenceRecord>>
    where
        F: Fn(&PreferenceRecord, &PreferenceRecord) -> bool,
    {
        let inner = self.lock()?;
        Ok(inner
            .find_candidate(record, compatible)
            .map(|entry| entry.record.clone()))
    }

    /// Atomically take both users out of the pool and mark them claimed
    ///
    /// Either both records are removed or neither is; if one of them has already
    /// been taken by a concurrent caller this fails with `NotInQueue`.
    pub fn remove_pair(&self, user_a: &str, user_b: &str) -> Result<ClaimedPair> {
        let mut inner = self.lock()?;
        for user_id in [user_a, user_b] {
            if !inner.entries.contains_key(user_id) {
                return Err(ChatError::NotInQueue {
                    user_id: user_id.to_string(),
                }
                .into());
            }
        }
        if user_a == user_b {
            return Err(ChatError::InvalidRequest {
                reason: format!("cannot pair {} with itself", user_a),
            }
            .into());
        }

        Self::claim(&mut inner, user_a, user_b)
    }

    /// Scan and claim in one critical section
    ///
    /// Returns `None` when the requester is no longer waiting (someone else
    /// claimed it first) or no compatible candidate exists.
    pub fn claim_compatible<F>(&self, requester_id: &str, compatible: F) -> Result<Option<ClaimedPair>>
    where
        F: Fn(&PreferenceRecord, &PreferenceRecord) -> bool,
    {
        let mut inner = self.lock()?;
        let Some(requester) = inner.entries.get(requester_id).map(|e| e.record.clone()) else {
            return Ok(None);
        };
        let candidate_id = match inner.find_candidate(&requester, compatible) {
            Some(entry) => entry.record.user_id.clone(),
            None => return Ok(None),
        };

        Self::claim(&mut inner, requester_id, &candidate_id).map(Some)
    }

    fn claim(inner: &mut PoolInner, requester_id: &str, candidate_id: &str) -> Result<ClaimedPair> {
        let mut take = |user_id: &str| {
            let entry = inner.take(user_id);
            inner.claimed.insert(user_id.to_string());
            entry
        };
        // Presence of both entries is checked by the callers under the same lock.
        match (take(requester_id), take(candidate_id)) {
            (Some(requester), Some(candidate)) => Ok(ClaimedPair {
                seqs: (requester.seq, candidate.seq),
                requester: requester.record,
                candidate: candidate.record,
            }),
            _ => Err(ChatError::InternalError {
                message: format!("claim of {} and {} lost an entry", requester_id, candidate_id),
            }
            .into()),
        }
    }

    /// Clear the claim marks once the pair's room exists
    pub fn release(&self, pair: &ClaimedPair) -> Result<()> {
        let mut inner = self.lock()?;
        inner.claimed.remove(&pair.requester.user_id);
        inner.claimed.remove(&pair.candidate.user_id);
        Ok(())
    }

    /// Put a claimed pair back with its original ordering keys
    pub fn restore(&self, pair: ClaimedPair) -> Result<()> {
        let mut inner = self.lock()?;
        let ClaimedPair {
            requester,
            candidate,
            seqs,
        } = pair;

        for (record, seq) in [(requester, seqs.0), (candidate, seqs.1)] {
            inner.claimed.remove(&record.user_id);
            if inner.entries.contains_key(&record.user_id) {
                error!(
                    "Restoring {} into the waiting pool but it is already queued",
                    record.user_id
                );
                debug_assert!(false, "restored user {} was already queued", record.user_id);
                continue;
            }
            inner.insert(PoolEntry { record, seq });
        }
        Ok(())
    }

    /// Remove and return every record enqueued before `cutoff`
    pub fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<PreferenceRecord>> {
        let mut inner = self.lock()?;
        let expired: Vec<UserId> = inner
            .entries
            .values()
            .filter(|entry| entry.record.enqueued_at < cutoff)
            .map(|entry| entry.record.user_id.clone())
            .collect();

        Ok(expired
            .iter()
            .filter_map(|user_id| inner.take(user_id))
            .map(|entry| entry.record)
            .collect())
    }

    pub fn get(&self, user_id: &str) -> Result<Option<PreferenceRecord>> {
        Ok(self.lock()?.entries.get(user_id).map(|e| e.record.clone()))
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.lock()
            .map(|inner| inner.entries.contains_key(user_id))
            .unwrap_or(false)
    }

    pub fn is_claimed(&self, user_id: &str) -> bool {
        self.lock()
            .map(|inner| inner.claimed.contains(user_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of waiting users per mode
    pub fn size_by_mode(&self) -> Result<HashMap<ChatMode, usize>> {
        let inner = self.lock()?;
        Ok(inner
            .buckets
            .iter()
            .map(|(mode, bucket)| (*mode, bucket.len()))
            .collect())
    }

    /// All waiting user ids in FIFO order across modes
    pub fn waiting_users(&self) -> Result<Vec<UserId>> {
        let inner = self.lock()?;
        let mut entries: Vec<&PoolEntry> = inner.entries.values().collect();
        entries.sort_by_key(|e| e.order_key());
        Ok(entries.into_iter().map(|e| e.record.user_id.clone()).collect())
    }
}
