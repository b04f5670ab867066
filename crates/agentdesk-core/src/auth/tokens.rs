//! Credential newtypes.
//!
//! `AccessToken` has no `Serialize` impl, so nothing that is persisted can
//! ever carry one. Both types redact themselves in `Debug` output.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Short-lived bearer credential. Memory only.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessToken(***)")
    }
}

/// Long-lived credential used to mint new access tokens. Persisted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefreshToken(String);

impl RefreshToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefreshToken(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access: AccessToken,
    pub refresh: RefreshToken,
}

impl TokenPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: AccessToken::new(access),
            refresh: RefreshToken::new(refresh),
        }
    }
}

/// An access token together with the moment it was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub token: AccessToken,
    pub issued_at: DateTime<Utc>,
}

impl AccessGrant {
    pub fn new(token: AccessToken) -> Self {
        Self {
            token,
            issued_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, lifetime: Duration) -> bool {
        Utc::now() > self.issued_at + lifetime
    }

    /// Check if the token is within `buffer` of expiring and should be renewed
    pub fn needs_refresh(&self, lifetime: Duration, buffer: Duration) -> bool {
        Utc::now() > self.refresh_at(lifetime, buffer)
    }

    pub fn refresh_at(&self, lifetime: Duration, buffer: Duration) -> DateTime<Utc> {
        self.issued_at + lifetime - buffer
    }

    /// Time left before a refresh is due, zero if it already is.
    pub fn time_until_refresh(&self, lifetime: Duration, buffer: Duration) -> Duration {
        (self.refresh_at(lifetime, buffer) - Utc::now()).max(Duration::zero())
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self, lifetime: Duration) -> i64 {
        (self.issued_at + lifetime - Utc::now()).num_minutes().max(0)
    }
}
