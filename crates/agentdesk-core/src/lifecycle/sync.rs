//! Reconciles this context with session changes made by other contexts.

use std::sync::{Arc, Weak};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{LogoutReason, PersistedFragment};
use crate::lifecycle::CleanupOutcome;
use crate::manager::SessionCore;
use crate::storage::StorageEvent;

/// What a storage event did to the local session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Our own write, another key, or nothing to change.
    Ignored,
    /// Another context logged out; so did we.
    LoggedOut,
    /// Took over the other context's session or rotated tokens.
    Adopted,
    /// Another context signed in as a different user; our session was torn
    /// down and theirs adopted.
    Switched,
}

pub(crate) fn spawn(core: &Arc<SessionCore>, rx: broadcast::Receiver<StorageEvent>) -> Option<JoinHandle<()>> {
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            warn!("No async runtime, cross-context sync disabled");
            return None;
        }
    };
    Some(runtime.spawn(sync_loop(Arc::downgrade(core), rx)))
}

async fn sync_loop(weak: Weak<SessionCore>, mut rx: broadcast::Receiver<StorageEvent>) {
    loop {
        let received = rx.recv().await;
        let Some(core) = weak.upgrade() else {
            return;
        };
        match received {
            Ok(event) => {
                handle_event(&core, &event);
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed storage events, reconciling with current value");
                reconcile(&core);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

pub(crate) fn handle_event(core: &Arc<SessionCore>, event: &StorageEvent) -> SyncAction {
    if event.origin == core.context() || event.key != core.session.key() {
        return SyncAction::Ignored;
    }
    debug!(origin = %event.origin, deleted = event.is_deletion(), "Session changed in another context");

    match event.new_value.as_deref() {
        None if event.is_deletion() => logged_out_elsewhere(core),
        None => SyncAction::Ignored,
        Some(raw) => match PersistedFragment::parse(raw) {
            Ok(fragment) => apply_fragment(core, fragment),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable session fragment from another context");
                SyncAction::Ignored
            }
        },
    }
}

/// Compare against whatever storage holds now, for when events were lost.
pub(crate) fn reconcile(core: &Arc<SessionCore>) -> SyncAction {
    match core.session.load_fragment() {
        Some(fragment) => apply_fragment(core, fragment),
        None if core.session.snapshot().has_session() => logged_out_elsewhere(core),
        None => SyncAction::Ignored,
    }
}

fn logged_out_elsewhere(core: &Arc<SessionCore>) -> SyncAction {
    match core.end_session(LogoutReason::RemoteLogout) {
        CleanupOutcome::Performed => {
            info!("Session ended in another context");
            SyncAction::LoggedOut
        }
        CleanupOutcome::AlreadyLoggedOut | CleanupOutcome::InProgress => SyncAction::Ignored,
    }
}

fn apply_fragment(core: &Arc<SessionCore>, fragment: PersistedFragment) -> SyncAction {
    if !fragment.is_restorable() {
        // Only a logout leaves storage without a usable session
        return logged_out_elsewhere(core);
    }

    let local = core.session.snapshot();
    let incoming_user = fragment.user.as_ref().map(|u| u.id.clone());
    let switched = match (local.user_id(), incoming_user.as_deref()) {
        (Some(ours), Some(theirs)) => ours != theirs,
        _ => false,
    };
    if switched {
        info!("Another context signed in as a different user");
        core.end_session(LogoutReason::AccountSwitched);
    }
    let had_user = local.user.is_some() && !switched;

    if !core.session.adopt(fragment) {
        return SyncAction::Ignored;
    }
    if !had_user {
        core.bind_telemetry();
    }
    if core.session.snapshot().is_authenticated() {
        core.start_refresh();
    }
    if switched {
        SyncAction::Switched
    } else {
        SyncAction::Adopted
    }
}
