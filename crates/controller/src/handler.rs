//! Alert predicates and payload construction.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, Pod};
use kalert_core::{AlertPayload, ResolvedObject};
use kalert_notify::Notifier;
use tracing::{debug, info};

use crate::ReconcileError;

/// Decides whether a resolved object is alert-worthy and delivers the alert.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    async fn handle(&self, obj: &ResolvedObject) -> Result<(), ReconcileError>;
}

#[async_trait]
impl<H: AlertHandler + ?Sized> AlertHandler for Arc<H> {
    async fn handle(&self, obj: &ResolvedObject) -> Result<(), ReconcileError> {
        (**self).handle(obj).await
    }
}

/// Container waiting reasons that mean the pod will not become ready on its own.
const BACKOFF_REASONS: &[&str] =
    &["CrashLoopBackOff", "ImagePullBackOff", "ErrImagePull", "CreateContainerConfigError"];

fn describe(reason: &str, message: &str) -> String {
    match (reason.is_empty(), message.is_empty()) {
        (false, false) => format!("{reason} {message}"),
        (true, _) => message.to_string(),
        (false, true) => reason.to_string(),
    }
}

async fn deliver(notifier: &dyn Notifier, payload: AlertPayload) -> Result<(), ReconcileError> {
    info!(kind = %payload.kind, ns = %payload.namespace, name = %payload.name, error = %payload.error, "alert");
    notifier.notify(&payload).await?;
    Ok(())
}

/// Alerts on `Warning` events, describing the involved object.
pub struct EventHandler {
    notifier: Arc<dyn Notifier>,
}

impl EventHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self { Self { notifier } }

    /// Payload for a warning event; `None` for normal events.
    pub fn alert_for(event: &Event) -> Option<AlertPayload> {
        if event.type_.as_deref() != Some("Warning") {
            return None;
        }
        let involved = &event.involved_object;
        Some(AlertPayload {
            kind: involved.kind.clone().unwrap_or_default(),
            namespace: involved.namespace.clone().unwrap_or_default(),
            name: involved.name.clone().unwrap_or_default(),
            error: describe(
                event.reason.as_deref().unwrap_or_default(),
                event.message.as_deref().unwrap_or_default(),
            ),
        })
    }
}

#[async_trait]
impl AlertHandler for EventHandler {
    async fn handle(&self, obj: &ResolvedObject) -> Result<(), ReconcileError> {
        let ResolvedObject::Event(event) = obj else {
            return Err(ReconcileError::TypeMismatch { expected: "Event", found: obj.kind() });
        };
        match Self::alert_for(event) {
            Some(payload) => deliver(self.notifier.as_ref(), payload).await,
            None => {
                debug!(reason = ?event.reason, "normal event; nothing to alert");
                Ok(())
            }
        }
    }
}

/// Alerts on pods that failed, went unknown, or have a container stuck in back-off.
pub struct PodHandler {
    notifier: Arc<dyn Notifier>,
}

impl PodHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self { Self { notifier } }

    /// Payload for an unhealthy pod; `None` for pods that are fine.
    pub fn alert_for(pod: &Pod) -> Option<AlertPayload> {
        let status = pod.status.as_ref()?;
        let error = match status.phase.as_deref() {
            Some(phase @ ("Failed" | "Unknown")) => describe(
                status.reason.as_deref().unwrap_or(phase),
                status.message.as_deref().unwrap_or_default(),
            ),
            _ => status
                .init_container_statuses
                .iter()
                .chain(status.container_statuses.iter())
                .flatten()
                .find_map(|cs| {
                    let waiting = cs.state.as_ref()?.waiting.as_ref()?;
                    let reason = waiting.reason.as_deref()?;
                    BACKOFF_REASONS
                        .contains(&reason)
                        .then(|| describe(reason, waiting.message.as_deref().unwrap_or_default()))
                })?,
        };
        Some(AlertPayload {
            kind: "Pod".to_string(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
            error,
        })
    }
}

#[async_trait]
impl AlertHandler for PodHandler {
    async fn handle(&self, obj: &ResolvedObject) -> Result<(), ReconcileError> {
        let ResolvedObject::Pod(pod) = obj else {
            return Err(ReconcileError::TypeMismatch { expected: "Pod", found: obj.kind() });
        };
        match Self::alert_for(pod) {
            Some(payload) => deliver(self.notifier.as_ref(), payload).await,
            None => Ok(()),
        }
    }
}
