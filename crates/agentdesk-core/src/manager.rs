//! The session manager: one per execution context.
//!
//! Construction restores any persisted session synchronously; everything
//! asynchronous (validation, refresh, cross-context sync) runs on the ambient
//! tokio runtime. Dropping the last `SessionManager` clone stops its
//! background tasks without logging out.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::IdentityService;
use crate::auth::{LogoutReason, Rotation, SessionState, SessionStatus, SessionStore, TokenPair, UserProfile};
use crate::config::SessionConfig;
use crate::dependents::DependentStore;
use crate::lifecycle::hooks::fire_and_forget;
use crate::lifecycle::rehydrate::{self, PendingValidation};
use crate::lifecycle::sync;
use crate::lifecycle::{
    CleanupCascade, CleanupOutcome, LogNavigator, Navigator, RefreshPolicy, RefreshScheduler,
    RehydrationOutcome, SyncAction, Telemetry, TracingTelemetry,
};
use crate::storage::{ContextId, PersistenceAdapter, SharedStore, StorageEvent};

enum Rehydration {
    /// Nothing was restored; the first `rehydrate` call reports that.
    NothingRestored,
    Pending(PendingValidation),
    Done,
}

pub(crate) struct SessionCore {
    pub(crate) config: SessionConfig,
    pub(crate) session: SessionStore,
    pub(crate) identity: Arc<dyn IdentityService>,
    scheduler: RefreshScheduler,
    cascade: CleanupCascade,
    telemetry: Arc<dyn Telemetry>,
    rehydration: Mutex<Rehydration>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionCore {
    pub(crate) fn context(&self) -> ContextId {
        self.session.persistence().context()
    }

    pub(crate) fn end_session(&self, reason: LogoutReason) -> CleanupOutcome {
        self.cascade.run(&self.scheduler, &self.session, reason)
    }

    pub(crate) fn start_refresh(self: &Arc<Self>) {
        self.scheduler.start(self);
    }

    pub(crate) fn bind_telemetry(&self) {
        if let Some(user) = self.session.snapshot().user {
            fire_and_forget("telemetry", || self.telemetry.identify(&user));
        }
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.scheduler.stop();
        if let Ok(mut task) = self.sync_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

pub struct SessionManagerBuilder {
    store: Arc<SharedStore>,
    identity: Arc<dyn IdentityService>,
    config: SessionConfig,
    telemetry: Arc<dyn Telemetry>,
    navigator: Arc<dyn Navigator>,
    dependents: Vec<Arc<dyn DependentStore>>,
}

impl SessionManagerBuilder {
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    /// Register a store to reset on logout. Stores are reset in the order
    /// they are registered, so register derived stores after their sources
    /// (agent selection before conversation selection).
    pub fn dependent(mut self, store: Arc<dyn DependentStore>) -> Self {
        self.dependents.push(store);
        self
    }

    /// Create the manager and restore any persisted session.
    ///
    /// Must be called inside a tokio runtime for cross-context sync to run.
    pub fn build(self) -> SessionManager {
        let key = self.config.session_key.clone();
        self.store.watch(&key);
        let handle = self.store.handle();
        // Subscribe before restoring so no change slips between the two
        let events = handle.subscribe();

        let session = SessionStore::new(PersistenceAdapter::new(handle), key);
        let pending = rehydrate::restore(&session);
        let rehydration = match pending {
            Some(pending) => Rehydration::Pending(pending),
            None => Rehydration::NothingRestored,
        };

        let core = Arc::new(SessionCore {
            scheduler: RefreshScheduler::new(RefreshPolicy::from_config(&self.config)),
            cascade: CleanupCascade::new(self.dependents, Arc::clone(&self.telemetry), self.navigator),
            config: self.config,
            session,
            identity: self.identity,
            telemetry: self.telemetry,
            rehydration: Mutex::new(rehydration),
            sync_task: Mutex::new(None),
        });

        let task = sync::spawn(&core, events);
        if let Ok(mut slot) = core.sync_task.lock() {
            *slot = task;
        }
        debug!(context = %core.context(), backend = core.session.persistence().handle().store().backend_kind(), "Session manager ready");

        SessionManager { core }
    }
}

/// Handle to one context's session. Clone is cheap.
#[derive(Clone)]
pub struct SessionManager {
    core: Arc<SessionCore>,
}

impl SessionManager {
    pub fn builder(store: &Arc<SharedStore>, identity: Arc<dyn IdentityService>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            store: Arc::clone(store),
            identity,
            config: SessionConfig::default(),
            telemetry: Arc::new(TracingTelemetry),
            navigator: Arc::new(LogNavigator),
            dependents: Vec::new(),
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.core.session.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.core.session.snapshot()
    }

    pub fn status(&self) -> SessionStatus {
        self.core.session.status()
    }

    /// Provisionally authenticated; fine for choosing what to render.
    pub fn is_authenticated(&self) -> bool {
        self.core.session.snapshot().is_authenticated()
    }

    /// Confirmed by the identity service; required for protected actions.
    pub fn is_confirmed(&self) -> bool {
        self.core.session.snapshot().is_confirmed()
    }

    pub fn is_refresh_running(&self) -> bool {
        self.core.scheduler.is_running()
    }

    pub fn is_persistence_degraded(&self) -> bool {
        self.core.session.persistence().is_degraded()
    }

    pub fn context(&self) -> ContextId {
        self.core.context()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Begin a session after an explicit sign-in.
    pub fn set_auth(&self, user: UserProfile, tokens: TokenPair) {
        info!(user_id = %user.id, "Signed in");
        self.core.session.set_auth(user, tokens);
        self.core.bind_telemetry();
        self.core.start_refresh();
    }

    /// Rotate credentials, keeping the user. Ignored when signed out; ends
    /// the session if another context already signed out.
    pub fn set_tokens(&self, tokens: TokenPair) -> Rotation {
        let rotation = self.core.session.set_tokens(tokens);
        if rotation == Rotation::Revoked {
            self.core.end_session(LogoutReason::RemoteLogout);
        }
        rotation
    }

    pub fn update_user_phone(&self, phone: Option<String>) -> bool {
        self.core.session.update_user_phone(phone)
    }

    pub fn set_loading(&self, loading: bool) {
        self.core.session.set_loading(loading);
    }

    /// Sign out. Safe to call repeatedly.
    pub fn logout(&self) -> CleanupOutcome {
        self.core.end_session(LogoutReason::UserInitiated)
    }

    /// Confirm the session restored at construction with the identity
    /// service. Only the first call does anything.
    pub async fn rehydrate(&self) -> RehydrationOutcome {
        let pending = {
            let Ok(mut slot) = self.core.rehydration.lock() else {
                warn!("Rehydration lock poisoned");
                return RehydrationOutcome::AlreadyRan;
            };
            match std::mem::replace(&mut *slot, Rehydration::Done) {
                Rehydration::Pending(pending) => pending,
                Rehydration::NothingRestored => return RehydrationOutcome::NoSession,
                Rehydration::Done => return RehydrationOutcome::AlreadyRan,
            }
        };
        rehydrate::confirm(&self.core, pending).await
    }

    /// Run [`SessionManager::rehydrate`] in the background.
    pub fn spawn_rehydration(&self) -> JoinHandle<RehydrationOutcome> {
        let manager = self.clone();
        tokio::spawn(async move { manager.rehydrate().await })
    }

    /// Process a storage event synchronously, as the sync task would.
    pub fn handle_storage_event(&self, event: &StorageEvent) -> SyncAction {
        sync::handle_event(&self.core, event)
    }

    /// Re-read storage and reconcile, for when change events may have been lost.
    pub fn reconcile(&self) -> SyncAction {
        sync::reconcile(&self.core)
    }

    /// Page is going away. Diagnostic only; nothing is mutated.
    pub fn on_page_hide(&self) {
        let state = self.core.session.snapshot();
        let policy = self.core.scheduler.policy();
        let grant = state.access.as_ref();
        info!(
            context = %self.core.context(),
            authenticated = state.is_authenticated(),
            validated = state.validated,
            refresh_running = self.core.scheduler.is_running(),
            persistence_degraded = self.core.session.persistence().is_degraded(),
            access_expired = ?grant.map(|g| g.is_expired(policy.access_lifetime)),
            refresh_due = ?grant.map(|g| g.needs_refresh(policy.access_lifetime, policy.refresh_buffer)),
            minutes_until_expiry = ?grant.map(|g| g.minutes_until_expiry(policy.access_lifetime)),
            "Page hidden"
        );
    }
}
