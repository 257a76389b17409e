//! Session authentication
//!
//! Turns the token a client presents at connection time into a user id. The
//! core trusts whatever identity comes back and performs no other credential
//! checks.

use crate::error::{ChatError, Result};
use crate::types::UserId;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Trait for the identity/session collaborator
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    /// Resolve a session token to the user it belongs to
    async fn authenticate(&self, token: &str) -> Result<UserId>;
}

/// Token table loaded from configuration
#[derive(Debug, Default, Clone)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, UserId>) -> Self {
        Self { tokens }
    }

    /// Add a token for a user
    pub fn add_token(&mut self, token: impl Into<String>, user_id: impl Into<UserId>) {
        self.tokens.insert(token.into(), user_id.into());
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl SessionAuthenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<UserId> {
        match self.tokens.get(token) {
            Some(user_id) => {
                debug!("Session token accepted for {}", user_id);
                Ok(user_id.clone())
            }
            None => {
                warn!("Rejected unknown session token");
                Err(ChatError::Unauthorized {
                    reason: "unknown session token".to_string(),
                }
                .into())
            }
        }
    }
}

/// Development mode: the token is the user id
///
/// Only constructed when `auth.trust_user_ids` is set in configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustedUserIdAuthenticator;

#[async_trait]
impl SessionAuthenticator for TrustedUserIdAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<UserId> {
        let user_id = token.trim();
        if user_id.is_empty() {
            return Err(ChatError::Unauthorized {
                reason: "empty user id".to_string(),
            }
            .into());
        }
        Ok(user_id.to_string())
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
