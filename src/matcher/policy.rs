//! Pairing predicates
//!
//! The matcher only applies hard filters: nothing here scores or ranks
//! candidates, ordering among compatible candidates is FIFO in the pool.

use crate::moderation::Moderation;
use crate::types::PreferenceRecord;
use std::sync::Arc;

/// Decides whether two waiting records may be paired
pub trait PairingPolicy: Send + Sync {
    fn compatible(&self, a: &PreferenceRecord, b: &PreferenceRecord) -> bool;
}

/// Same mode, mutually accepted genders, overlapping age ranges
pub fn passes_hard_filters(a: &PreferenceRecord, b: &PreferenceRecord) -> bool {
    a.user_id != b.user_id
        && a.mode == b.mode
        && a.gender_filter.accepts(b.gender)
        && b.gender_filter.accepts(a.gender)
        && a.ages.overlaps(&b.ages)
}

/// Hard filters plus the block list and skip cooldowns
pub struct HardFilterPolicy {
    moderation: Arc<Moderation>,
}

impl HardFilterPolicy {
    pub fn new(moderation: Arc<Moderation>) -> Self {
        Self { moderation }
    }
}

impl PairingPolicy for HardFilterPolicy {
    fn compatible(&self, a: &PreferenceRecord, b: &PreferenceRecord) -> bool {
        passes_hard_filters(a, b) && self.moderation.allows(&a.user_id, &b.user_id)
    }
}
