//! agentdesk-core - the session and token lifecycle of the agentdesk
//! dashboard.
//!
//! A [`SessionManager`] decides whether the dashboard is signed in, holds the
//! credentials needed for authorized calls, survives restarts through a
//! persisted fragment, follows logins and logouts made by other contexts
//! sharing the same store, and unwinds every dependent store on logout.

pub mod api;
pub mod auth;
pub mod config;
pub mod dependents;
pub mod lifecycle;
pub mod manager;
pub mod storage;

pub use api::{HttpIdentityClient, IdentityError, IdentityService, Validation};
pub use auth::{
    LogoutReason, PersistedFragment, Rotation, SessionState, SessionStatus, TokenPair, UserProfile,
};
pub use config::{SessionConfig, StorageMode};
pub use dependents::{AgentSelection, ConversationSelection, DependentStore};
pub use lifecycle::{CleanupOutcome, Navigator, RehydrationOutcome, SyncAction, Telemetry};
pub use manager::{SessionManager, SessionManagerBuilder};
pub use storage::{SharedStore, StorageEvent};
