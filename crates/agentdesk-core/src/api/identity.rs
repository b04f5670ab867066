use async_trait::async_trait;

use super::IdentityError;
use crate::auth::{RefreshToken, TokenPair};

/// Answer to a rehydration check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub is_valid: bool,
    /// A fresh pair, when the service chose to rotate on validation.
    pub tokens: Option<TokenPair>,
}

impl Validation {
    pub fn valid(tokens: TokenPair) -> Self {
        Self {
            is_valid: true,
            tokens: Some(tokens),
        }
    }

    pub fn invalid() -> Self {
        Self {
            is_valid: false,
            tokens: None,
        }
    }
}

/// The remote identity service, as far as the session lifecycle needs it.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// Check a stored refresh token once at startup.
    async fn validate(&self, refresh_token: &RefreshToken) -> Result<Validation, IdentityError>;

    /// Exchange a refresh token for a new credential pair.
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenPair, IdentityError>;
}
