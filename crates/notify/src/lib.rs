//! kube-event-alert notification sinks.
//!
//! A [`Notifier`] delivers one [`AlertPayload`] to an external channel. Delivery may
//! be repeated for the same payload when the reconciler retries, so sinks must not
//! assume they are called once.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use kalert_core::AlertPayload;

mod error;
mod webhook;

pub use error::NotifyError;
pub use webhook::{WebhookNotifier, DEFAULT_USERNAME};

/// Delivers alert payloads. Any error is interpreted as a retryable failure.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, payload: &AlertPayload) -> Result<(), NotifyError>;
}

#[async_trait]
impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    async fn notify(&self, payload: &AlertPayload) -> Result<(), NotifyError> {
        (**self).notify(payload).await
    }
}
