//! Authentication state for the dashboard.
//!
//! This module provides:
//! - `SessionState`: the in-memory session (user, credentials, flags)
//! - `SessionStore`: the container that owns it, persists the safe subset
//!   and notifies subscribers
//! - Credential newtypes that keep the access token out of storage
//!
//! Access tokens expire after 30 minutes and are refreshed 5 minutes early.

pub mod session;
pub mod store;
pub mod tokens;

pub use session::{
    LogoutReason, PersistedFragment, SessionState, SessionStatus, UserProfile, DEFAULT_SESSION_KEY,
};
pub use store::{Rotation, SessionStore};
pub use tokens::{AccessGrant, AccessToken, RefreshToken, TokenPair};
