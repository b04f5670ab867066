//! Fire-and-forget collaborators: telemetry identity binding and navigation.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, info, warn};

use crate::auth::{LogoutReason, UserProfile};

/// Crash-reporting / analytics identity binding.
///
/// Errors are logged and otherwise ignored; they never affect the session.
pub trait Telemetry: Send + Sync {
    fn identify(&self, user: &UserProfile) -> anyhow::Result<()>;
    fn clear(&self) -> anyhow::Result<()>;
}

/// Telemetry that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn identify(&self, user: &UserProfile) -> anyhow::Result<()> {
        debug!(user_id = %user.id, "Telemetry identify");
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        debug!("Telemetry cleared");
        Ok(())
    }
}

/// Routing hook for the sign-in entry point.
pub trait Navigator: Send + Sync {
    fn redirect_to_sign_in(&self, reason: LogoutReason);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNavigator;

impl Navigator for LogNavigator {
    fn redirect_to_sign_in(&self, reason: LogoutReason) {
        info!(?reason, "Session ended, sign-in required");
    }
}

/// Run a side channel call, containing both errors and panics.
pub(crate) fn fire_and_forget(channel: &str, f: impl FnOnce() -> anyhow::Result<()>) {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(channel, error = %e, "Side channel call failed"),
        Err(_) => warn!(channel, "Side channel call panicked"),
    }
}
