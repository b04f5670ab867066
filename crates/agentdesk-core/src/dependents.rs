//! Feature stores that cache session-scoped data.
//!
//! The cleanup cascade only needs their `reset`; the selection API exists so
//! the rest of the dashboard has something to select with.

use std::sync::Mutex;

use tracing::debug;

/// A store holding data that must not outlive the session.
pub trait DependentStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Drop everything session-scoped. Must be idempotent.
    fn reset(&self);
}

/// Currently selected agent.
#[derive(Debug, Default)]
pub struct AgentSelection {
    selected: Mutex<Option<String>>,
}

impl AgentSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, agent_id: impl Into<String>) {
        if let Ok(mut selected) = self.selected.lock() {
            *selected = Some(agent_id.into());
        }
    }

    pub fn selected(&self) -> Option<String> {
        self.selected.lock().ok().and_then(|s| s.clone())
    }
}

impl DependentStore for AgentSelection {
    fn name(&self) -> &'static str {
        "agent_selection"
    }

    fn reset(&self) {
        if let Ok(mut selected) = self.selected.lock() {
            if selected.take().is_some() {
                debug!("Agent selection cleared");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRef {
    pub agent_id: String,
    pub conversation_id: String,
}

/// Currently open conversation; always belongs to an agent.
#[derive(Debug, Default)]
pub struct ConversationSelection {
    selected: Mutex<Option<ConversationRef>>,
}

impl ConversationSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, agent_id: impl Into<String>, conversation_id: impl Into<String>) {
        if let Ok(mut selected) = self.selected.lock() {
            *selected = Some(ConversationRef {
                agent_id: agent_id.into(),
                conversation_id: conversation_id.into(),
            });
        }
    }

    pub fn selected(&self) -> Option<ConversationRef> {
        self.selected.lock().ok().and_then(|s| s.clone())
    }
}

impl DependentStore for ConversationSelection {
    fn name(&self) -> &'static str {
        "conversation_selection"
    }

    fn reset(&self) {
        if let Ok(mut selected) = self.selected.lock() {
            if selected.take().is_some() {
                debug!("Conversation selection cleared");
            }
        }
    }
}
