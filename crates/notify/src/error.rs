//! Error types for notification delivery.

use thiserror::Error;

/// Why a notification could not be delivered. Every variant is treated as
/// retryable by the reconciler.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Transport failure (connect, TLS, timeout, body encoding).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with something other than 200 OK.
    #[error("webhook responded with status {status}: {body}")]
    Status { status: u16, body: String },
}
