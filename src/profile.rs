//! Profile collaborator
//!
//! The core only carries opaque user ids; display attributes for MATCH_FOUND
//! come from here.

use crate::error::Result;
use crate::types::{ProfileCard, UserId};
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn profile(&self, user_id: &str) -> Result<ProfileCard>;
}

/// Profiles from configuration; unknown users get an anonymous card
#[derive(Debug, Default, Clone)]
pub struct StaticProfileDirectory {
    cards: HashMap<UserId, ProfileCard>,
}

impl StaticProfileDirectory {
    pub fn new(cards: impl IntoIterator<Item = ProfileCard>) -> Self {
        Self {
            cards: cards
                .into_iter()
                .map(|card| (card.user_id.clone(), card))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

#[async_trait]
impl ProfileDirectory for StaticProfileDirectory {
    async fn profile(&self, user_id: &str) -> Result<ProfileCard> {
        Ok(self
            .cards
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| ProfileCard::anonymous(user_id)))
    }
}
