use thiserror::Error;

/// Failure of a single key/value operation against non-volatile storage.
///
/// `NotFound` is kept apart from every other variant: callers substitute a
/// default for it without raising their voice.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,
    #[error("key `{key}` holds a value of a different type")]
    TypeMismatch { key: String },
    #[error("key `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("slot id {id} is outside 1..={max}")]
    InvalidSlot { id: usize, max: usize },
    #[error("change applied but not persisted: {0}")]
    Storage(#[from] StoreError),
}

/// Failure reported by a fan drive backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("actuator: {0}")]
pub struct ActuatorError(pub String);
