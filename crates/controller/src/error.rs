use kalert_core::{KeyError, LookupError};
use kalert_notify::NotifyError;

/// Outcome of a failed processing attempt.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("malformed key: {0}")]
    MalformedKey(#[from] KeyError),

    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("delivery failed: {0}")]
    Delivery(#[from] NotifyError),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl ReconcileError {
    /// Failures that are a property of the item itself; retrying cannot help.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::MalformedKey(_) | Self::TypeMismatch { .. } | Self::Panicked(_))
    }
}
