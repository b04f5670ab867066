use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage quota exceeded writing {key} ({bytes} bytes)")]
    QuotaExceeded { key: String, bytes: usize },

    #[error("Storage is disabled: {0}")]
    Disabled(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),
}

impl StorageError {
    /// True when the backend can never succeed for the rest of this process
    /// (as opposed to a single write being too large).
    pub fn is_permanent(&self) -> bool {
        matches!(self, StorageError::Disabled(_))
    }
}
