//! Durable storage for the session fragment.
//!
//! This module provides:
//! - `StorageBackend` implementations: in-memory, file-per-key and OS keyring
//! - `SharedStore`: one store shared by every session context, publishing
//!   change events so other contexts can react
//! - `PersistenceAdapter`: read-back verified writes that degrade to
//!   memory-only instead of failing

pub mod adapter;
pub mod backend;
pub mod error;
pub mod keyring;
pub mod shared;

pub use adapter::PersistenceAdapter;
pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use error::StorageError;
pub use self::keyring::KeyringBackend;
pub use shared::{ContextId, SharedStore, StorageEvent, StoreHandle};
