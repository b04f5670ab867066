//! Several contexts sharing one store.

mod support;

use std::sync::Arc;

use agentdesk_core::storage::{ContextId, FileBackend, MemoryBackend, StorageBackend, StorageEvent};
use agentdesk_core::{LogoutReason, SharedStore, SyncAction, TokenPair};
use support::*;

#[tokio::test]
async fn test_logout_in_one_tab_logs_out_the_other() {
    let store = memory_store();
    let tab_a = Tab::open(&store, ScriptedIdentity::new());
    let tab_b = Tab::open(&store, ScriptedIdentity::new());

    tab_a.manager.set_auth(user("x"), TokenPair::new("a1", "r1"));
    assert!(wait_until(&tab_b.manager, |s| s.is_confirmed()).await);
    assert_eq!(tab_b.manager.snapshot().user_id(), Some("x"));
    tab_b.agents.select("agent-7");

    tab_a.manager.logout();
    assert!(wait_until(&tab_b.manager, |s| !s.has_session()).await);

    let state = tab_b.manager.snapshot();
    assert_eq!(state.last_logout, Some(LogoutReason::RemoteLogout));
    assert!(tab_b.agents.selected().is_none());
    assert_eq!(tab_b.resets(), vec!["agents", "conversations"]);
    assert_eq!(tab_b.redirects(), vec![LogoutReason::RemoteLogout]);
    assert!(!tab_b.manager.is_refresh_running());
    assert!(persisted(&store).is_none());
}

#[tokio::test]
async fn test_deletion_event_logs_out_synchronously() {
    let store = memory_store();
    let tab = Tab::open(&store, ScriptedIdentity::new());
    tab.manager.set_auth(user("x"), TokenPair::new("a1", "r1"));

    let event = StorageEvent {
        key: KEY.to_string(),
        old_value: persisted(&store),
        new_value: None,
        origin: ContextId::EXTERNAL,
    };
    assert_eq!(tab.manager.handle_storage_event(&event), SyncAction::LoggedOut);
    // Same turn, no await in between
    assert!(!tab.manager.is_authenticated());
}

#[tokio::test]
async fn test_own_events_are_ignored() {
    let store = memory_store();
    let tab = Tab::open(&store, ScriptedIdentity::new());
    tab.manager.set_auth(user("x"), TokenPair::new("a1", "r1"));

    let event = StorageEvent {
        key: KEY.to_string(),
        old_value: persisted(&store),
        new_value: None,
        origin: tab.manager.context(),
    };
    assert_eq!(tab.manager.handle_storage_event(&event), SyncAction::Ignored);
    assert!(tab.manager.is_confirmed());

    // A write by this tab reaches its own sync task and must not echo
    tab.manager.set_tokens(TokenPair::new("a2", "r2"));
    settle().await;
    assert_eq!(tab.manager.snapshot().access_token().unwrap().expose(), "a2");
    assert!(tab.redirects().is_empty());
}

#[tokio::test]
async fn test_other_keys_are_ignored() {
    let store = memory_store();
    let tab = Tab::open(&store, ScriptedIdentity::new());
    tab.manager.set_auth(user("x"), TokenPair::new("a1", "r1"));

    let event = StorageEvent {
        key: "agentdesk.theme".to_string(),
        old_value: Some("dark".to_string()),
        new_value: None,
        origin: ContextId::EXTERNAL,
    };
    assert_eq!(tab.manager.handle_storage_event(&event), SyncAction::Ignored);
    assert!(tab.manager.is_confirmed());
}

#[tokio::test]
async fn test_rotation_in_another_tab_is_adopted_without_rewriting() {
    let store = memory_store();
    let tab = Tab::open(&store, ScriptedIdentity::new());
    tab.manager.set_auth(user("x"), TokenPair::new("a1", "r1"));

    let rotated = seeded_fragment("x", "r5").to_json().unwrap();
    let event = StorageEvent {
        key: KEY.to_string(),
        old_value: persisted(&store),
        new_value: Some(rotated.clone()),
        origin: ContextId::EXTERNAL,
    };
    assert_eq!(tab.manager.handle_storage_event(&event), SyncAction::Adopted);

    let state = tab.manager.snapshot();
    assert_eq!(state.refresh_token.as_ref().unwrap().expose(), "r5");
    // Same user, so our access token stays usable
    assert_eq!(state.access_token().unwrap().expose(), "a1");
    // Adopting never writes back
    assert!(!persisted(&store).unwrap().contains("r5"));

    // Replaying the same value is a no-op
    assert_eq!(tab.manager.handle_storage_event(&event), SyncAction::Ignored);
}

#[tokio::test]
async fn test_login_as_different_user_elsewhere_switches_account() {
    let store = memory_store();
    let tab = Tab::open(&store, ScriptedIdentity::new());
    tab.manager.set_auth(user("x"), TokenPair::new("a1", "r1"));
    tab.conversations.select("agent-1", "conv-1");

    let event = StorageEvent {
        key: KEY.to_string(),
        old_value: persisted(&store),
        new_value: Some(seeded_fragment("y", "ry").to_json().unwrap()),
        origin: ContextId::EXTERNAL,
    };
    assert_eq!(tab.manager.handle_storage_event(&event), SyncAction::Switched);

    let state = tab.manager.snapshot();
    assert_eq!(state.user_id(), Some("y"));
    assert!(state.access.is_none());
    assert!(state.is_confirmed());
    assert!(tab.conversations.selected().is_none());
    // Switching is not a reason to show the sign-in page
    assert!(tab.redirects().is_empty());
    assert_eq!(tab.telemetry_events(), vec!["identify:x", "clear", "identify:y"]);
}

#[tokio::test]
async fn test_unreadable_remote_value_is_ignored() {
    let store = memory_store();
    let tab = Tab::open(&store, ScriptedIdentity::new());
    tab.manager.set_auth(user("x"), TokenPair::new("a1", "r1"));

    let event = StorageEvent {
        key: KEY.to_string(),
        old_value: None,
        new_value: Some("<html>".to_string()),
        origin: ContextId::EXTERNAL,
    };
    assert_eq!(tab.manager.handle_storage_event(&event), SyncAction::Ignored);
    assert!(tab.manager.is_confirmed());
}

#[tokio::test]
async fn test_remote_logout_ignores_inflight_validation() {
    let store = memory_store();
    seed(&store, &seeded_fragment("x", "r1"));
    let (identity, gate) = ScriptedIdentity::new()
        .validate_with(Ok(agentdesk_core::Validation::valid(TokenPair::new("a2", "r2"))))
        .gate_validation();
    let tab = Tab::open(&store, identity);
    let pending = tab.manager.spawn_rehydration();
    settle().await;

    // Another tab logs out while we are still validating
    store.remove(ContextId::EXTERNAL, KEY).unwrap();
    assert!(wait_until(&tab.manager, |s| !s.has_session()).await);
    gate.notify_one();

    assert_eq!(
        pending.await.unwrap(),
        agentdesk_core::RehydrationOutcome::Superseded
    );
    assert!(!tab.manager.is_authenticated());
    assert!(persisted(&store).is_none());
}

#[tokio::test]
async fn test_reconcile_after_missed_events() {
    let dir = tempfile::tempdir().unwrap();
    let store = SharedStore::new(FileBackend::new(dir.path()));
    let tab = Tab::open(&store, ScriptedIdentity::new());
    tab.manager.set_auth(user("x"), TokenPair::new("a1", "r1"));

    // Storage is unchanged: nothing to do
    assert_eq!(tab.manager.reconcile(), SyncAction::Ignored);

    // Removed behind the store's back, so no event is ever published
    FileBackend::new(dir.path()).remove(KEY).unwrap();
    assert_eq!(tab.manager.reconcile(), SyncAction::LoggedOut);
    assert!(!tab.manager.is_authenticated());
    assert_eq!(tab.manager.snapshot().last_logout, Some(LogoutReason::RemoteLogout));
}

#[tokio::test]
async fn test_refresh_after_remote_logout_does_not_resurrect_session() {
    let store = memory_store();
    let (identity, gate) = ScriptedIdentity::new().gate_refresh();
    let tab_a = Tab::open(&store, ScriptedIdentity::new());
    let tab_b = Tab::open(&store, identity);

    tab_a.manager.set_auth(user("x"), TokenPair::new("a1", "r1"));
    // B adopts without an access token and refreshes straight away
    assert!(wait_until(&tab_b.manager, |s| s.is_confirmed()).await);
    settle().await;
    assert_eq!(tab_b.identity.refreshes(), 1);

    tab_a.manager.logout();
    gate.notify_one();
    assert!(wait_until(&tab_b.manager, |s| !s.has_session()).await);
    settle().await;

    assert!(persisted(&store).is_none());
    assert!(!tab_a.manager.is_authenticated());
    assert!(!tab_b.manager.is_authenticated());
}

#[tokio::test]
async fn test_other_process_logout_detected_by_polling() {
    let dir = tempfile::tempdir().unwrap();
    let store = SharedStore::new(FileBackend::new(dir.path()));
    let tab = Tab::open(&store, ScriptedIdentity::new());
    tab.manager.set_auth(user("x"), TokenPair::new("a1", "r1"));

    // A second process with its own view of the same directory
    let other: Arc<SharedStore> = SharedStore::new(FileBackend::new(dir.path()));
    other.handle().remove(KEY).unwrap();

    assert_eq!(store.poll_external(), 1);
    assert!(wait_until(&tab.manager, |s| !s.has_session()).await);
    assert_eq!(tab.manager.snapshot().last_logout, Some(LogoutReason::RemoteLogout));
}

#[tokio::test]
async fn test_late_rejection_of_replaced_token_keeps_newer_session() {
    let store = memory_store();
    seed(&store, &seeded_fragment("x", "r1"));
    // The answer for r1 is a rejection, but it arrives late
    let (identity, gate) = ScriptedIdentity::new().gate_validation();
    let tab_a = Tab::open(&store, identity);
    let pending = tab_a.manager.spawn_rehydration();
    settle().await;
    assert_eq!(tab_a.identity.validations(), 1);

    let tab_c = Tab::open(&store, ScriptedIdentity::new());
    tab_c.manager.set_auth(user("x"), TokenPair::new("a9", "r9"));
    assert!(wait_until(&tab_a.manager, |s| s.is_confirmed()).await);

    gate.notify_one();
    assert_eq!(
        pending.await.unwrap(),
        agentdesk_core::RehydrationOutcome::Superseded
    );
    settle().await;

    assert!(tab_a.manager.is_confirmed());
    assert!(tab_a.redirects().is_empty());
    assert!(tab_c.manager.is_confirmed());
    assert_eq!(tab_c.manager.snapshot().last_logout, None);
    assert!(persisted(&store).is_some());
}

#[tokio::test]
async fn test_storage_failure_in_one_tab_is_invisible_to_others() {
    let store = SharedStore::new(MemoryBackend::with_quota(200));
    let tab_a = Tab::open(&store, ScriptedIdentity::new());
    let tab_b = Tab::open(&store, ScriptedIdentity::new());
    tab_a.manager.set_auth(user("x"), TokenPair::new("a1", "r1"));
    assert!(wait_until(&tab_b.manager, |s| s.is_confirmed()).await);
    settle().await;

    // Too large for the quota
    tab_a.manager.set_tokens(TokenPair::new("a2", "r".repeat(300)));
    settle().await;

    assert!(tab_a.manager.is_persistence_degraded());
    assert!(tab_a.manager.is_confirmed());
    assert!(!tab_b.manager.is_persistence_degraded());
    assert!(tab_b.manager.is_confirmed());
    assert_eq!(tab_b.manager.snapshot().last_logout, None);
    assert!(tab_b.redirects().is_empty());
    assert!(persisted(&store).is_some());
}
