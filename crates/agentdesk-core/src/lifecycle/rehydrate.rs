//! Startup restoration of a persisted session.
//!
//! Restoration is trust-then-verify: the persisted fragment is applied
//! synchronously as a provisional session (so the UI does not flash a
//! signed-out state), and only becomes `validated` once the identity
//! service accepts the refresh token.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::api::{IdentityError, Validation};
use crate::auth::{LogoutReason, RefreshToken, Rotation, SessionStore};
use crate::manager::SessionCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RehydrationOutcome {
    /// Nothing persisted; signed out without a network call.
    NoSession,
    /// The identity service accepted the restored session.
    Confirmed,
    /// The restored session was rejected (or could not be checked) and has
    /// been cleared.
    Rejected,
    /// A logout or a new login happened while validation was in flight;
    /// its result was discarded.
    Superseded,
    /// Rehydration already ran for this manager.
    AlreadyRan,
}

/// A provisionally restored session waiting on the identity service.
#[derive(Debug)]
pub(crate) struct PendingValidation {
    generation: u64,
    refresh_token: RefreshToken,
}

/// Apply the persisted fragment, if any. Never touches the network.
pub(crate) fn restore(session: &SessionStore) -> Option<PendingValidation> {
    let fragment = session.load_fragment().unwrap_or_default();
    if !fragment.is_restorable() {
        debug!("No persisted session to restore");
        session.restore(fragment);
        return None;
    }

    let refresh_token = fragment.refresh_token.clone()?;
    let generation = session.restore(fragment)?;
    info!(user_id = ?session.snapshot().user_id(), "Restored session, awaiting validation");
    Some(PendingValidation {
        generation,
        refresh_token,
    })
}

/// Ask the identity service about a restored session and act on the answer.
pub(crate) async fn confirm(core: &Arc<SessionCore>, pending: PendingValidation) -> RehydrationOutcome {
    let timeout = core.config.request_timeout();
    let result = match tokio::time::timeout(timeout, core.identity.validate(&pending.refresh_token)).await {
        Ok(result) => result,
        Err(_) => Err(IdentityError::Timeout(timeout)),
    };

    // Anything may have happened while we were suspended
    if !core.session.is_current(pending.generation) {
        debug!("Session changed during validation, discarding result");
        return RehydrationOutcome::Superseded;
    }

    match result {
        Ok(Validation { is_valid: true, tokens }) => {
            match core.session.confirm(pending.generation, tokens) {
                Rotation::Applied => {}
                Rotation::Stale => return RehydrationOutcome::Superseded,
                Rotation::Revoked => {
                    info!("Session was ended elsewhere during validation");
                    core.end_session(LogoutReason::RemoteLogout);
                    return RehydrationOutcome::Superseded;
                }
            }
            info!("Restored session confirmed");
            core.bind_telemetry();
            core.start_refresh();
            RehydrationOutcome::Confirmed
        }
        Ok(Validation { is_valid: false, .. }) => {
            info!("Restored session rejected by identity service");
            core.end_session(LogoutReason::ValidationFailed);
            RehydrationOutcome::Rejected
        }
        Err(e) => {
            warn!(error = %e, "Could not validate restored session");
            core.end_session(LogoutReason::ValidationFailed);
            RehydrationOutcome::Rejected
        }
    }
}
