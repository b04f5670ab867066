use serde::{Deserialize, Serialize};

use super::tokens::{AccessGrant, AccessToken, RefreshToken};

/// Storage key for the persisted session fragment.
pub const DEFAULT_SESSION_KEY: &str = "agentdesk.session";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Why the last session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum LogoutReason {
    UserInitiated,
    ValidationFailed,
    RefreshRejected,
    RefreshExhausted,
    RemoteLogout,
    AccountSwitched,
}

impl LogoutReason {
    /// Whether the user should be sent back to the sign-in entry point.
    pub fn requires_sign_in(&self) -> bool {
        !matches!(self, LogoutReason::UserInitiated | LogoutReason::AccountSwitched)
    }

    /// Logouts signalled through storage leave storage alone: it already
    /// holds the other context's answer.
    pub fn clears_storage(&self) -> bool {
        !matches!(self, LogoutReason::RemoteLogout | LogoutReason::AccountSwitched)
    }
}

/// The in-memory session. Owned by `SessionStore`; everyone else sees clones.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub user: Option<UserProfile>,
    pub access: Option<AccessGrant>,
    pub refresh_token: Option<RefreshToken>,
    /// Trusted for display purposes, possibly before the identity service
    /// has confirmed the refresh token.
    pub provisionally_authenticated: bool,
    /// The identity service has accepted this session. Gate anything
    /// security-sensitive on this, not on the provisional flag.
    pub validated: bool,
    pub loading: bool,
    pub last_logout: Option<LogoutReason>,
    /// Bumped whenever a session ends or a new one begins. Async work
    /// captures it before suspending and drops its result if it moved.
    pub generation: u64,
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        self.provisionally_authenticated && self.user.is_some() && self.refresh_token.is_some()
    }

    pub fn is_confirmed(&self) -> bool {
        self.is_authenticated() && self.validated
    }

    /// Anything left that a logout would have to tear down.
    pub fn has_session(&self) -> bool {
        self.user.is_some()
            || self.access.is_some()
            || self.refresh_token.is_some()
            || self.provisionally_authenticated
    }

    pub fn access_token(&self) -> Option<&AccessToken> {
        self.access.as_ref().map(|grant| &grant.token)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    pub fn invariants_hold(&self) -> bool {
        let provisional_ok =
            !self.provisionally_authenticated || (self.user.is_some() && self.refresh_token.is_some());
        let validated_ok = !self.validated || self.provisionally_authenticated;
        provisional_ok && validated_ok
    }

    pub fn to_fragment(&self) -> PersistedFragment {
        PersistedFragment {
            user: self.user.clone(),
            refresh_token: self.refresh_token.clone(),
            authenticated: self.is_confirmed(),
        }
    }

    pub fn status(&self, persistence_degraded: bool) -> SessionStatus {
        SessionStatus {
            user: self.user.clone(),
            authenticated: self.is_authenticated(),
            validated: self.is_confirmed(),
            loading: self.loading,
            persistence_degraded,
            last_logout: self.last_logout,
        }
    }
}

/// The subset of the session that survives a restart.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedFragment {
    pub user: Option<UserProfile>,
    pub refresh_token: Option<RefreshToken>,
    pub authenticated: bool,
}

impl PersistedFragment {
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        let fragment: Self = serde_json::from_str(raw)?;
        Ok(fragment.normalized())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.clone().normalized())
    }

    /// A fragment without a refresh token can never claim to be authenticated.
    pub fn normalized(mut self) -> Self {
        if self.refresh_token.is_none() || self.user.is_none() {
            self.authenticated = false;
        }
        self
    }

    /// Enough material to attempt rehydration.
    pub fn is_restorable(&self) -> bool {
        self.user.is_some() && self.refresh_token.is_some()
    }
}

/// Secret-free view of the session for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub user: Option<UserProfile>,
    pub authenticated: bool,
    pub validated: bool,
    pub loading: bool,
    pub persistence_degraded: bool,
    pub last_logout: Option<LogoutReason>,
}
