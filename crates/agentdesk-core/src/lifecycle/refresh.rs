//! Background renewal of the access token.
//!
//! One task per authenticated period. It sleeps until the access token is
//! within the refresh buffer of expiring (immediately if there is none),
//! exchanges the refresh token, and feeds the new pair back into the
//! session store. Transient failures are retried on a shorter interval;
//! a rejected credential or too many consecutive failures end the session.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::IdentityError;
use crate::auth::{LogoutReason, Rotation, SessionState};
use crate::config::SessionConfig;
use crate::manager::SessionCore;

/// Upper bound of the random delay added to each scheduled refresh, as a
/// fraction of the delay itself.
const JITTER_FRACTION: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub access_lifetime: chrono::Duration,
    pub refresh_buffer: chrono::Duration,
    pub retry_interval: Duration,
    pub max_consecutive_failures: u32,
    pub request_timeout: Duration,
}

impl RefreshPolicy {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            access_lifetime: config.access_token_lifetime(),
            refresh_buffer: config.refresh_buffer(),
            retry_interval: config.retry_interval(),
            max_consecutive_failures: config.max_refresh_failures.max(1),
            request_timeout: config.request_timeout(),
        }
    }

    /// How long to wait before the next refresh of `state`.
    pub fn delay_for(&self, state: &SessionState) -> Duration {
        let Some(grant) = state.access.as_ref() else {
            return Duration::ZERO;
        };
        let base = grant
            .time_until_refresh(self.access_lifetime, self.refresh_buffer)
            .to_std()
            .unwrap_or(Duration::ZERO);
        base + jitter(base)
    }
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

fn jitter(base: Duration) -> Duration {
    let max = base.mul_f64(JITTER_FRACTION);
    if max.is_zero() {
        return Duration::ZERO;
    }
    max.mul_f64(rand::thread_rng().gen_range(0.0..1.0))
}

pub struct RefreshScheduler {
    policy: RefreshPolicy,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(policy: RefreshPolicy) -> Self {
        Self {
            policy,
            task: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|task| task.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Start refreshing for `core`. No-op if already running, or if there is
    /// no tokio runtime to run on.
    pub(crate) fn start(&self, core: &Arc<SessionCore>) {
        let Ok(mut task) = self.task.lock() else {
            warn!("Refresh scheduler lock poisoned");
            return;
        };
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Refresh scheduler already running");
            return;
        }
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!("No async runtime, token refresh disabled");
                return;
            }
        };
        let weak = Arc::downgrade(core);
        let policy = self.policy.clone();
        *task = Some(runtime.spawn(refresh_loop(weak, policy)));
        debug!("Refresh scheduler started");
    }

    /// Cancel the pending refresh, if any. Safe to call when stopped.
    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
                debug!("Refresh scheduler stopped");
            }
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn refresh_loop(weak: Weak<SessionCore>, policy: RefreshPolicy) {
    let mut failures: u32 = 0;
    let mut delay = match weak.upgrade() {
        Some(core) => policy.delay_for(&core.session.snapshot()),
        None => return,
    };

    loop {
        if !delay.is_zero() {
            debug!(delay_secs = delay.as_secs(), "Next token refresh scheduled");
            tokio::time::sleep(delay).await;
        }

        let Some(core) = weak.upgrade() else {
            return;
        };
        let generation = core.session.generation();
        let Some(refresh_token) = core.session.refresh_token() else {
            debug!("No refresh token, refresh scheduler exiting");
            return;
        };

        let result = match tokio::time::timeout(policy.request_timeout, core.identity.refresh(&refresh_token)).await
        {
            Ok(result) => result,
            Err(_) => Err(IdentityError::Timeout(policy.request_timeout)),
        };

        if !core.session.is_current(generation) {
            // Logged out, replaced, or handed a newer token by another
            // context while we were waiting on the network
            debug!("Session changed during refresh, discarding result");
            delay = policy.delay_for(&core.session.snapshot());
            continue;
        }

        match result {
            Ok(tokens) => {
                failures = 0;
                match core.session.set_tokens_if_current(generation, tokens) {
                    Rotation::Applied => info!("Access token refreshed"),
                    Rotation::Stale => {}
                    Rotation::Revoked => {
                        info!("Session was ended elsewhere during refresh");
                        core.end_session(LogoutReason::RemoteLogout);
                        return;
                    }
                }
                delay = policy.delay_for(&core.session.snapshot());
            }
            Err(e) if e.is_invalid_credential() => {
                warn!(error = %e, "Refresh token rejected, ending session");
                core.end_session(LogoutReason::RefreshRejected);
                return;
            }
            Err(e) => {
                failures += 1;
                warn!(
                    error = %e,
                    failures,
                    max_failures = policy.max_consecutive_failures,
                    "Token refresh failed"
                );
                if failures >= policy.max_consecutive_failures {
                    warn!("Token refresh failed too many times, ending session");
                    core.end_session(LogoutReason::RefreshExhausted);
                    return;
                }
                delay = policy.retry_interval;
            }
        }
    }
}
