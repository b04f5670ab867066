//! The origin-scoped store shared by every session context in the process.
//!
//! All writes go through [`SharedStore`], which publishes a [`StorageEvent`]
//! tagged with the writer's [`ContextId`] whenever a value actually changes.
//! This is the process-local equivalent of browser `storage` events: every
//! context sees every change, and is expected to skip its own.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{StorageBackend, StorageResult};
use super::StorageError;

/// Capacity of the change notification channel.
/// Session writes are rare; 64 leaves plenty of room for bursts of rotation.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Identifies one execution context (one "tab") writing to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    /// Origin used for changes made outside this process.
    pub const EXTERNAL: ContextId = ContextId(0);

    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_external(&self) -> bool {
        *self == Self::EXTERNAL
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_external() {
            write!(f, "external")
        } else {
            write!(f, "ctx-{}", self.0)
        }
    }
}

/// A change to one key of the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub origin: ContextId,
}

impl StorageEvent {
    /// The key went from present to absent.
    pub fn is_deletion(&self) -> bool {
        self.old_value.is_some() && self.new_value.is_none()
    }
}

pub struct SharedStore {
    backend: Box<dyn StorageBackend>,
    /// Last value seen per watched key; also serializes writers.
    known: Mutex<HashMap<String, Option<String>>>,
    events: broadcast::Sender<StorageEvent>,
}

impl fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStore")
            .field("backend", &self.backend.kind())
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl SharedStore {
    pub fn new(backend: impl StorageBackend + 'static) -> Arc<Self> {
        Self::from_boxed(Box::new(backend))
    }

    pub fn from_boxed(backend: Box<dyn StorageBackend>) -> Arc<Self> {
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            backend,
            known: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Open a new execution context on this store.
    pub fn handle(self: &Arc<Self>) -> StoreHandle {
        StoreHandle {
            store: Arc::clone(self),
            context: ContextId::next(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    fn known(&self) -> StorageResult<MutexGuard<'_, HashMap<String, Option<String>>>> {
        self.known
            .lock()
            .map_err(|_| StorageError::Disabled("shared store lock poisoned".to_string()))
    }

    /// Track `key` so that [`SharedStore::poll_external`] reports changes to it.
    pub fn watch(&self, key: &str) {
        let current = self.backend.get(key).ok().flatten();
        if let Ok(mut known) = self.known() {
            known.entry(key.to_string()).or_insert(current);
        }
    }

    pub fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.backend.get(key)
    }

    pub fn set(&self, origin: ContextId, key: &str, value: &str) -> StorageResult<()> {
        self.write(origin, key, Some(value))
    }

    pub fn remove(&self, origin: ContextId, key: &str) -> StorageResult<()> {
        self.write(origin, key, None)
    }

    /// Write `value` only if `accept` approves of what is stored right now.
    /// The check and the write happen under the writer lock, so no other
    /// context in this process can slip in between. Returns whether the
    /// value was written.
    pub fn set_if(
        &self,
        origin: ContextId,
        key: &str,
        value: &str,
        accept: impl FnOnce(Option<&str>) -> bool,
    ) -> StorageResult<bool> {
        let event = {
            let mut known = self.known()?;
            let current = self.backend.get(key)?;
            if !accept(current.as_deref()) {
                return Ok(false);
            }
            self.backend.set(key, value)?;
            let new_value = Some(value.to_string());
            known.insert(key.to_string(), new_value.clone());
            if current == new_value {
                return Ok(true);
            }
            StorageEvent {
                key: key.to_string(),
                old_value: current,
                new_value,
                origin,
            }
        };
        self.publish(event);
        Ok(true)
    }

    fn write(&self, origin: ContextId, key: &str, value: Option<&str>) -> StorageResult<()> {
        let event = {
            let mut known = self.known()?;
            let old_value = match known.get(key) {
                Some(last) => last.clone(),
                None => self.backend.get(key).ok().flatten(),
            };
            match value {
                Some(v) => self.backend.set(key, v)?,
                None => self.backend.remove(key)?,
            }
            let new_value = value.map(str::to_string);
            known.insert(key.to_string(), new_value.clone());
            if old_value == new_value {
                return Ok(());
            }
            StorageEvent {
                key: key.to_string(),
                old_value,
                new_value,
                origin,
            }
        };
        self.publish(event);
        Ok(())
    }

    fn publish(&self, event: StorageEvent) {
        trace!(key = %event.key, origin = %event.origin, deleted = event.is_deletion(), "Storage change");
        if self.events.send(event).is_err() {
            trace!("No subscribers for storage change");
        }
    }

    /// Re-read every watched key and publish changes made outside this
    /// process. Returns the number of changes found.
    pub fn poll_external(&self) -> usize {
        let changes: Vec<StorageEvent> = {
            let Ok(mut known) = self.known() else {
                return 0;
            };
            let mut changes = Vec::new();
            for (key, last) in known.iter_mut() {
                let current = match self.backend.get(key) {
                    Ok(current) => current,
                    Err(e) => {
                        debug!(key = %key, error = %e, "Failed to poll storage key");
                        continue;
                    }
                };
                if current != *last {
                    changes.push(StorageEvent {
                        key: key.clone(),
                        old_value: last.clone(),
                        new_value: current.clone(),
                        origin: ContextId::EXTERNAL,
                    });
                    *last = current;
                }
            }
            changes
        };
        let count = changes.len();
        for event in changes {
            self.publish(event);
        }
        count
    }

    /// Poll for external changes every `interval` until the store is dropped.
    pub fn spawn_external_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                let changes = store.poll_external();
                if changes > 0 {
                    debug!(changes, "Detected external storage changes");
                }
            }
        })
    }
}

/// One context's view of the shared store. Writes are tagged with its id.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    store: Arc<SharedStore>,
    context: ContextId,
}

impl StoreHandle {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.store.get(key)
    }

    pub fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.store.set(self.context, key, value)
    }

    pub fn remove(&self, key: &str) -> StorageResult<()> {
        self.store.remove(self.context, key)
    }

    pub fn set_if(&self, key: &str, value: &str, accept: impl FnOnce(Option<&str>) -> bool) -> StorageResult<bool> {
        self.store.set_if(self.context, key, value, accept)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.store.subscribe()
    }
}
