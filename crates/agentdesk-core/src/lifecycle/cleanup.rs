//! The single teardown path for every kind of logout.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::hooks::{fire_and_forget, Navigator, Telemetry};
use super::refresh::RefreshScheduler;
use crate::auth::{LogoutReason, SessionStore};
use crate::dependents::DependentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// A session was torn down.
    Performed,
    /// Nothing to tear down.
    AlreadyLoggedOut,
    /// Another cleanup is running; this call did nothing.
    InProgress,
}

pub struct CleanupCascade {
    dependents: Vec<Arc<dyn DependentStore>>,
    telemetry: Arc<dyn Telemetry>,
    navigator: Arc<dyn Navigator>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CleanupCascade {
    pub fn new(
        dependents: Vec<Arc<dyn DependentStore>>,
        telemetry: Arc<dyn Telemetry>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            dependents,
            telemetry,
            navigator,
            running: AtomicBool::new(false),
        }
    }

    pub fn dependent_names(&self) -> Vec<&'static str> {
        self.dependents.iter().map(|d| d.name()).collect()
    }

    /// Stop refreshing, clear memory, clear storage, unbind telemetry, then
    /// reset dependents in registration order.
    ///
    /// Nothing here yields, so no other callback can observe a half-cleared
    /// session. Dependents and telemetry are only touched when a session was
    /// actually torn down.
    pub fn run(&self, scheduler: &RefreshScheduler, session: &SessionStore, reason: LogoutReason) -> CleanupOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(?reason, "Cleanup already in progress");
            return CleanupOutcome::InProgress;
        }
        let _guard = RunningGuard(&self.running);

        scheduler.stop();

        if !session.clear(reason) {
            debug!(?reason, "Logout requested with no active session");
            return CleanupOutcome::AlreadyLoggedOut;
        }

        fire_and_forget("telemetry", || self.telemetry.clear());

        for dependent in &self.dependents {
            if catch_unwind(AssertUnwindSafe(|| dependent.reset())).is_err() {
                warn!(store = dependent.name(), "Dependent store panicked during reset");
            } else {
                debug!(store = dependent.name(), "Dependent store reset");
            }
        }

        info!(?reason, "Session cleared");
        if reason.requires_sign_in() {
            self.navigator.redirect_to_sign_in(reason);
        }
        CleanupOutcome::Performed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{TokenPair, UserProfile};
    use crate::lifecycle::hooks::{LogNavigator, TracingTelemetry};
    use crate::lifecycle::RefreshPolicy;
    use crate::storage::{MemoryBackend, PersistenceAdapter, SharedStore};
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl DependentStore for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn reset(&self) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    struct Exploding;

    impl DependentStore for Exploding {
        fn name(&self) -> &'static str {
            "exploding"
        }

        fn reset(&self) {
            panic!("reset failed");
        }
    }

    fn session() -> SessionStore {
        let shared = SharedStore::new(MemoryBackend::new());
        SessionStore::new(PersistenceAdapter::new(shared.handle()), "agentdesk.session")
    }

    fn signed_in(session: &SessionStore) {
        let user = UserProfile {
            id: "u1".to_string(),
            email: "u1@example.com".to_string(),
            display_name: None,
            phone: None,
        };
        session.set_auth(user, TokenPair::new("a1", "r1"));
    }

    #[test]
    fn test_dependents_reset_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cascade = CleanupCascade::new(
            vec![
                Arc::new(Recorder { name: "agents", log: Arc::clone(&log) }) as Arc<dyn DependentStore>,
                Arc::new(Exploding) as Arc<dyn DependentStore>,
                Arc::new(Recorder { name: "conversations", log: Arc::clone(&log) }) as Arc<dyn DependentStore>,
            ],
            Arc::new(TracingTelemetry),
            Arc::new(LogNavigator),
        );
        assert_eq!(cascade.dependent_names(), vec!["agents", "exploding", "conversations"]);

        let scheduler = RefreshScheduler::new(RefreshPolicy::default());
        let session = session();
        signed_in(&session);

        let outcome = cascade.run(&scheduler, &session, LogoutReason::UserInitiated);
        assert_eq!(outcome, CleanupOutcome::Performed);
        assert_eq!(*log.lock().unwrap(), vec!["agents", "conversations"]);
        assert!(!session.snapshot().has_session());
        assert!(session.persistence().read("agentdesk.session").is_none());
    }

    #[test]
    fn test_second_run_does_not_touch_dependents() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let cascade = CleanupCascade::new(
            vec![Arc::new(Recorder { name: "agents", log: Arc::clone(&log) }) as Arc<dyn DependentStore>],
            Arc::new(TracingTelemetry),
            Arc::new(LogNavigator),
        );
        let scheduler = RefreshScheduler::new(RefreshPolicy::default());
        let session = session();
        signed_in(&session);

        assert_eq!(cascade.run(&scheduler, &session, LogoutReason::UserInitiated), CleanupOutcome::Performed);
        assert_eq!(
            cascade.run(&scheduler, &session, LogoutReason::UserInitiated),
            CleanupOutcome::AlreadyLoggedOut
        );
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
