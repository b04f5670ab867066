//! The session state container.
//!
//! State lives inside a `tokio::sync::watch` sender. Every operation mutates
//! it through `send_modify`/`send_if_modified`, and any persistence happens
//! inside that same closure, so a subscriber is only woken once the state
//! and its persisted fragment both satisfy the session invariants.

use tokio::sync::watch;
use tracing::{debug, warn};

use super::session::{LogoutReason, PersistedFragment, SessionState, SessionStatus, UserProfile};
use super::tokens::{AccessGrant, RefreshToken, TokenPair};
use crate::storage::PersistenceAdapter;

/// Result of a credential update against the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Applied,
    /// The session it was meant for is gone from this context.
    Stale,
    /// Another context signed out or switched accounts in storage.
    Revoked,
}

pub struct SessionStore {
    state: watch::Sender<SessionState>,
    persistence: PersistenceAdapter,
    key: String,
}

impl SessionStore {
    pub fn new(persistence: PersistenceAdapter, key: impl Into<String>) -> Self {
        let (state, _rx) = watch::channel(SessionState::default());
        Self {
            state,
            persistence,
            key: key.into(),
        }
    }

    /// Receive every committed state. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.state.borrow().status(self.persistence.is_degraded())
    }

    pub fn generation(&self) -> u64 {
        self.state.borrow().generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation() == generation
    }

    pub fn refresh_token(&self) -> Option<RefreshToken> {
        self.state.borrow().refresh_token.clone()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn persistence(&self) -> &PersistenceAdapter {
        &self.persistence
    }

    /// Start a new, confirmed session. Returns its generation.
    pub fn set_auth(&self, user: UserProfile, tokens: TokenPair) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|state| {
            *state = SessionState {
                user: Some(user),
                access: Some(AccessGrant::new(tokens.access)),
                refresh_token: Some(tokens.refresh),
                provisionally_authenticated: true,
                validated: true,
                loading: state.loading,
                last_logout: None,
                generation: state.generation + 1,
            };
            generation = state.generation;
            self.persist(state);
        });
        generation
    }

    /// Rotate credentials without touching the user.
    pub fn set_tokens(&self, tokens: TokenPair) -> Rotation {
        let generation = self.generation();
        self.set_tokens_if_current(generation, tokens)
    }

    /// Rotate credentials only if no logout or new login happened since
    /// `generation` was observed, and the persisted fragment still belongs
    /// to this user.
    pub fn set_tokens_if_current(&self, generation: u64, tokens: TokenPair) -> Rotation {
        let mut outcome = Rotation::Stale;
        self.state.send_if_modified(|state| {
            if state.generation != generation {
                debug!(expected = generation, current = state.generation, "Discarding stale token rotation");
                return false;
            }
            if state.user.is_none() {
                debug!("Ignoring token rotation without a user");
                return false;
            }
            let mut next = state.clone();
            next.access = Some(AccessGrant::new(tokens.access));
            next.refresh_token = Some(tokens.refresh);
            outcome = self.commit_owned(state, next);
            outcome == Rotation::Applied
        });
        outcome
    }

    /// Mark a restored session as confirmed by the identity service.
    pub fn confirm(&self, generation: u64, tokens: Option<TokenPair>) -> Rotation {
        let mut outcome = Rotation::Stale;
        self.state.send_if_modified(|state| {
            if state.generation != generation || state.user.is_none() {
                return false;
            }
            let mut next = state.clone();
            if let Some(tokens) = tokens {
                next.access = Some(AccessGrant::new(tokens.access));
                next.refresh_token = Some(tokens.refresh);
            }
            if next.refresh_token.is_none() {
                return false;
            }
            next.provisionally_authenticated = true;
            next.validated = true;
            outcome = self.commit_owned(state, next);
            outcome == Rotation::Applied
        });
        outcome
    }

    /// Persist `next` over a fragment owned by the same user and install it.
    /// A missing fragment, or one for another user, means some other context
    /// signed out or switched accounts; writing would undo that.
    fn commit_owned(&self, state: &mut SessionState, next: SessionState) -> Rotation {
        debug_assert!(next.invariants_hold());
        let json = match next.to_fragment().to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize session fragment");
                *state = next;
                return Rotation::Applied;
            }
        };
        let user_id = next.user_id().map(str::to_string);
        let owned = self.persistence.write_if(&self.key, &json, |current| {
            current
                .and_then(|raw| PersistedFragment::parse(raw).ok())
                .and_then(|fragment| fragment.user)
                .map(|user| user.id)
                == user_id
        });
        if !owned {
            debug!("Persisted session no longer ours, refusing to overwrite it");
            return Rotation::Revoked;
        }
        *state = next;
        Rotation::Applied
    }

    /// Optimistically restore a persisted fragment. Nothing is written back.
    /// Returns the generation the restored session belongs to, if any.
    pub fn restore(&self, fragment: PersistedFragment) -> Option<u64> {
        let mut restored = None;
        self.state.send_if_modified(|state| {
            if !fragment.is_restorable() {
                let changed = state.provisionally_authenticated;
                state.provisionally_authenticated = false;
                state.validated = false;
                return changed;
            }
            state.user = fragment.user;
            state.refresh_token = fragment.refresh_token;
            state.access = None;
            state.provisionally_authenticated = true;
            state.validated = false;
            restored = Some(state.generation);
            debug_assert!(state.invariants_hold());
            true
        });
        restored
    }

    /// Take over a fragment written by another context. Never persists, the
    /// value is already in storage.
    ///
    /// A new refresh token or user starts a new generation, so validation or
    /// refresh calls still in flight with the old token are discarded.
    pub(crate) fn adopt(&self, fragment: PersistedFragment) -> bool {
        self.state.send_if_modified(|state| {
            let restorable = fragment.is_restorable();
            let validated = restorable && fragment.authenticated;
            let same_user = state.user_id() == fragment.user.as_ref().map(|u| u.id.as_str());
            if same_user
                && state.user == fragment.user
                && state.refresh_token == fragment.refresh_token
                && state.provisionally_authenticated == restorable
                && state.validated == validated
            {
                return false;
            }
            if !same_user || !restorable {
                // Our access token belonged to a different session
                state.access = None;
            }
            if !same_user || state.refresh_token != fragment.refresh_token {
                state.generation += 1;
            }
            state.user = fragment.user;
            state.refresh_token = fragment.refresh_token;
            state.provisionally_authenticated = restorable;
            state.validated = validated;
            debug_assert!(state.invariants_hold());
            true
        })
    }

    /// Pure local edit; no-op without a user.
    pub fn update_user_phone(&self, phone: Option<String>) -> bool {
        self.state.send_if_modified(|state| match state.user.as_mut() {
            Some(user) if user.phone != phone => {
                user.phone = phone;
                true
            }
            _ => false,
        })
    }

    pub fn set_loading(&self, loading: bool) {
        self.state.send_if_modified(|state| {
            let changed = state.loading != loading;
            state.loading = loading;
            changed
        });
    }

    /// Wipe the in-memory session and then its persisted fragment, before
    /// anyone is notified. Returns whether there was a session.
    pub(crate) fn clear(&self, reason: LogoutReason) -> bool {
        let mut had_session = false;
        self.state.send_if_modified(|state| {
            had_session = state.has_session();
            *state = SessionState {
                loading: false,
                last_logout: if had_session { Some(reason) } else { state.last_logout },
                generation: state.generation + 1,
                ..SessionState::default()
            };
            if reason.clears_storage() {
                self.persistence.remove(&self.key);
            }
            had_session
        });
        had_session
    }

    fn persist(&self, state: &SessionState) {
        match state.to_fragment().to_json() {
            Ok(json) => self.persistence.write(&self.key, &json),
            Err(e) => warn!(error = %e, "Failed to serialize session fragment"),
        }
    }

    /// Read the persisted fragment, dropping an unreadable one.
    pub fn load_fragment(&self) -> Option<PersistedFragment> {
        let raw = self.persistence.read(&self.key)?;
        match PersistedFragment::parse(&raw) {
            Ok(fragment) => Some(fragment),
            Err(e) => {
                warn!(key = %self.key, error = %e, "Discarding unreadable session fragment");
                self.persistence.remove(&self.key);
                None
            }
        }
    }
}
