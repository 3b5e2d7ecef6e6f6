//! kube-event-alert core types: object identity, resolved objects, alert payloads
//! and the collaborator traits the reconciler depends on.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Event, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

pub mod prelude {
    pub use super::{
        AlertPayload, KeyError, LookupError, ObjectKey, ObjectLookup, ResolvedObject,
        ResourceEventHandler, SyncError,
    };
}

/// Errors produced while computing or parsing an object key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unexpected key format: {0:?}")]
    Malformed(String),
    #[error("object has no metadata.name")]
    MissingName,
}

/// A point lookup against the mirror failed for reasons other than absence.
#[derive(Debug, Clone, thiserror::Error)]
#[error("lookup {key}: {reason}")]
pub struct LookupError {
    pub key: String,
    pub reason: String,
}

/// The mirror could not complete its initial listing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("watch failed before initial sync: {0}")]
pub struct SyncError(pub String);

/// Stable identity of a watched object.
///
/// The string form is `namespace/name`, or just `name` for cluster-scoped
/// objects (namespace is then empty).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Key for an object's metadata. A missing or empty name is an error.
    pub fn from_meta(meta: &ObjectMeta) -> Result<Self, KeyError> {
        let name = meta.name.as_deref().filter(|n| !n.is_empty()).ok_or(KeyError::MissingName)?;
        Ok(Self::new(meta.namespace.clone().unwrap_or_default(), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::new("", *name)),
            [ns, name] if !name.is_empty() => Ok(Self::new(*ns, *name)),
            _ => Err(KeyError::Malformed(key.to_string())),
        }
    }
}

/// `namespace/name` key string for an object's metadata.
pub fn meta_namespace_key(meta: &ObjectMeta) -> Result<String, KeyError> {
    ObjectKey::from_meta(meta).map(|k| k.to_string())
}

/// Current snapshot of a watched object as held by the mirror.
#[derive(Debug, Clone)]
pub enum ResolvedObject {
    Event(Event),
    Pod(Pod),
}

impl ResolvedObject {
    /// Kubernetes kind of the wrapped object.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "Event",
            Self::Pod(_) => "Pod",
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            Self::Event(e) => &e.metadata,
            Self::Pod(p) => &p.metadata,
        }
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    pub fn key(&self) -> Result<ObjectKey, KeyError> {
        ObjectKey::from_meta(self.meta())
    }
}

impl From<Event> for ResolvedObject {
    fn from(e: Event) -> Self { Self::Event(e) }
}

impl From<Pod> for ResolvedObject {
    fn from(p: Pod) -> Self { Self::Pod(p) }
}

/// Immutable description of one alert, built from a resolved object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlertPayload {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    /// Human readable `"{reason} {message}"`.
    pub error: String,
}

impl AlertPayload {
    /// One-line summary used as the notification text.
    pub fn summary(&self) -> String {
        format!("{} {}/{} - {}", self.kind, self.namespace, self.name, self.error)
    }
}

/// Point lookup into the local mirror. `Ok(None)` means the object is gone.
pub trait ObjectLookup: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<ResolvedObject>>, LookupError>;
}

/// Callbacks fired by the mirror as objects change.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, obj: &Arc<ResolvedObject>);
    fn on_update(&self, old: &Arc<ResolvedObject>, new: &Arc<ResolvedObject>);
    fn on_delete(&self, _obj: &Arc<ResolvedObject>) {}
}
