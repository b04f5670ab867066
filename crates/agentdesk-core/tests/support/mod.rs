//! Shared fixtures for the session lifecycle tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentdesk_core::auth::RefreshToken;
use agentdesk_core::storage::MemoryBackend;
use agentdesk_core::{
    AgentSelection, ConversationSelection, DependentStore, IdentityError, IdentityService,
    LogoutReason, Navigator, PersistedFragment, SessionManager, SessionState, SharedStore,
    Telemetry, TokenPair, UserProfile, Validation,
};
use async_trait::async_trait;
use tokio::sync::Notify;

pub const KEY: &str = "agentdesk.session";

pub fn user(id: &str) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        email: format!("{}@example.com", id),
        display_name: Some(id.to_uppercase()),
        phone: None,
    }
}

/// Identity service that answers from a script.
#[derive(Default)]
pub struct ScriptedIdentity {
    validations: Mutex<VecDeque<Result<Validation, IdentityError>>>,
    refreshes: Mutex<VecDeque<Result<TokenPair, IdentityError>>>,
    validate_gate: Option<Arc<Notify>>,
    refresh_gate: Option<Arc<Notify>>,
    pub validate_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub seen_refresh_tokens: Mutex<Vec<String>>,
}

impl ScriptedIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate_with(self, result: Result<Validation, IdentityError>) -> Self {
        self.validations.lock().unwrap().push_back(result);
        self
    }

    pub fn refresh_with(self, result: Result<TokenPair, IdentityError>) -> Self {
        self.refreshes.lock().unwrap().push_back(result);
        self
    }

    /// Hold validation until the returned handle is notified.
    pub fn gate_validation(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.validate_gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn gate_refresh(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.refresh_gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn validations(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityService for ScriptedIdentity {
    async fn validate(&self, _refresh_token: &RefreshToken) -> Result<Validation, IdentityError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.validate_gate {
            gate.notified().await;
        }
        self.validations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Validation::invalid()))
    }

    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenPair, IdentityError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.seen_refresh_tokens
            .lock()
            .unwrap()
            .push(refresh_token.expose().to_string());
        if let Some(gate) = &self.refresh_gate {
            gate.notified().await;
        }
        self.refreshes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(TokenPair::new(format!("a-ref{}", n), format!("r-ref{}", n))))
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    pub events: Mutex<Vec<String>>,
}

impl Telemetry for RecordingTelemetry {
    fn identify(&self, user: &UserProfile) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(format!("identify:{}", user.id));
        Ok(())
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.events.lock().unwrap().push("clear".to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    pub redirects: Mutex<Vec<LogoutReason>>,
}

impl Navigator for RecordingNavigator {
    fn redirect_to_sign_in(&self, reason: LogoutReason) {
        self.redirects.lock().unwrap().push(reason);
    }
}

/// Records resets of the dependent stores in the order they happen.
pub struct ResetLog {
    pub name: &'static str,
    pub log: Arc<Mutex<Vec<&'static str>>>,
}

impl DependentStore for ResetLog {
    fn name(&self) -> &'static str {
        self.name
    }

    fn reset(&self) {
        self.log.lock().unwrap().push(self.name);
    }
}

/// One simulated tab and everything it is wired to.
pub struct Tab {
    pub manager: SessionManager,
    pub identity: Arc<ScriptedIdentity>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub navigator: Arc<RecordingNavigator>,
    pub agents: Arc<AgentSelection>,
    pub conversations: Arc<ConversationSelection>,
    pub resets: Arc<Mutex<Vec<&'static str>>>,
}

impl Tab {
    pub fn open(store: &Arc<SharedStore>, identity: ScriptedIdentity) -> Self {
        let identity = Arc::new(identity);
        let telemetry = Arc::new(RecordingTelemetry::default());
        let navigator = Arc::new(RecordingNavigator::default());
        let agents = Arc::new(AgentSelection::new());
        let conversations = Arc::new(ConversationSelection::new());
        let resets = Arc::new(Mutex::new(Vec::new()));

        let manager = SessionManager::builder(store, identity.clone())
            .telemetry(telemetry.clone())
            .navigator(navigator.clone())
            .dependent(agents.clone())
            .dependent(Arc::new(ResetLog { name: "agents", log: Arc::clone(&resets) }))
            .dependent(conversations.clone())
            .dependent(Arc::new(ResetLog { name: "conversations", log: Arc::clone(&resets) }))
            .build();

        Self {
            manager,
            identity,
            telemetry,
            navigator,
            agents,
            conversations,
            resets,
        }
    }

    pub fn redirects(&self) -> Vec<LogoutReason> {
        self.navigator.redirects.lock().unwrap().clone()
    }

    pub fn telemetry_events(&self) -> Vec<String> {
        self.telemetry.events.lock().unwrap().clone()
    }

    pub fn resets(&self) -> Vec<&'static str> {
        self.resets.lock().unwrap().clone()
    }
}

pub fn memory_store() -> Arc<SharedStore> {
    SharedStore::new(MemoryBackend::new())
}

/// Write a fragment as if a previous run had left it behind.
pub fn seed(store: &Arc<SharedStore>, fragment: &PersistedFragment) {
    store
        .handle()
        .set(KEY, &fragment.to_json().unwrap())
        .unwrap();
}

pub fn seeded_fragment(user_id: &str, refresh: &str) -> PersistedFragment {
    PersistedFragment {
        user: Some(user(user_id)),
        refresh_token: Some(RefreshToken::new(refresh)),
        authenticated: true,
    }
}

pub fn persisted(store: &Arc<SharedStore>) -> Option<String> {
    store.get(KEY).unwrap()
}

/// Wait (bounded) until the manager's state satisfies `pred`.
pub async fn wait_until(manager: &SessionManager, pred: impl Fn(&SessionState) -> bool) -> bool {
    let mut rx = manager.subscribe();
    let waited = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|state| pred(state))).await;
    matches!(waited, Ok(Ok(_)))
}

/// Let spawned tasks run without advancing time.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
