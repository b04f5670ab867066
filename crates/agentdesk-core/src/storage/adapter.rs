//! Read-back verified persistence that never fails its caller.
//!
//! Any storage problem (quota exceeded, storage disabled, I/O error, or a
//! write that does not read back) flips the adapter into memory-only mode for
//! the rest of the process. The session keeps working; it just won't survive
//! a restart.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use super::shared::{ContextId, StoreHandle};

#[derive(Debug)]
pub struct PersistenceAdapter {
    handle: StoreHandle,
    degraded: AtomicBool,
}

impl PersistenceAdapter {
    pub fn new(handle: StoreHandle) -> Self {
        Self {
            handle,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn handle(&self) -> &StoreHandle {
        &self.handle
    }

    pub fn context(&self) -> ContextId {
        self.handle.context()
    }

    /// True once a persistence failure has been seen; later writes are skipped.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn read(&self, key: &str) -> Option<String> {
        match self.handle.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to read from storage");
                if e.is_permanent() {
                    self.degrade(key);
                }
                None
            }
        }
    }

    pub fn write(&self, key: &str, value: &str) {
        if self.is_degraded() {
            debug!(key, "Storage degraded, keeping value in memory only");
            return;
        }

        if let Err(e) = self.handle.set(key, value) {
            warn!(key, error = %e, "Failed to persist value, continuing in memory only");
            self.degrade(key);
            return;
        }
        self.verify(key, value);
    }

    fn verify(&self, key: &str, value: &str) {
        match self.handle.get(key) {
            Ok(Some(stored)) if stored == value => {}
            Ok(Some(_)) => {
                warn!(key, "Persisted value did not read back, continuing in memory only");
                self.degrade(key);
            }
            Ok(None) => {
                warn!(key, "Persisted value missing on read-back, continuing in memory only");
                self.degrade(key);
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to verify persisted value, continuing in memory only");
                self.degrade(key);
            }
        }
    }

    /// Write only if `accept` approves of the value currently stored.
    ///
    /// Returns false when the current value was refused; storage failures
    /// degrade as in [`PersistenceAdapter::write`] and return true, since the
    /// caller should carry on in memory.
    pub fn write_if(&self, key: &str, value: &str, accept: impl FnOnce(Option<&str>) -> bool) -> bool {
        if self.is_degraded() {
            debug!(key, "Storage degraded, keeping value in memory only");
            return true;
        }

        match self.handle.set_if(key, value, accept) {
            Ok(true) => {
                self.verify(key, value);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(key, error = %e, "Failed to persist value, continuing in memory only");
                self.degrade(key);
                true
            }
        }
    }

    /// Removal is attempted even in degraded mode so a stale entry cannot
    /// outlive a logout.
    pub fn remove(&self, key: &str) {
        if let Err(e) = self.handle.remove(key) {
            warn!(key, error = %e, "Failed to remove value from storage");
        }
    }

    fn degrade(&self, key: &str) {
        if self.degraded.swap(true, Ordering::AcqRel) {
            return;
        }
        // The stored entry is shared with other contexts; leave it alone.
        // An outdated refresh token in it is rejected at the next validation.
        warn!(key, backend = self.handle.store().backend_kind(), "Persistence degraded to memory-only");
    }
}
