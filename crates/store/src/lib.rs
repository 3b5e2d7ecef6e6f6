//! kube-event-alert store: the object mirror.
//!
//! Holds the latest copy of every watched object keyed by `namespace/name`.
//! Readers get lock-free point lookups against an immutable snapshot; the watcher
//! task swaps in a new snapshot per change and fans the change out to the
//! registered [`ResourceEventHandler`]s.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use kalert_core::{LookupError, ObjectKey, ObjectLookup, ResolvedObject, ResourceEventHandler, SyncError};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

type Objects = FxHashMap<ObjectKey, Arc<ResolvedObject>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SyncState {
    Pending,
    Synced,
    Failed(String),
}

/// Eventually consistent local copy of the watched objects.
pub struct Mirror {
    objects: ArcSwap<Objects>,
    handlers: RwLock<Vec<Arc<dyn ResourceEventHandler>>>,
    sync_tx: watch::Sender<SyncState>,
    epoch: AtomicU64,
}

impl Default for Mirror {
    fn default() -> Self { Self::new() }
}

impl Mirror {
    pub fn new() -> Self {
        let (sync_tx, _) = watch::channel(SyncState::Pending);
        Self {
            objects: ArcSwap::from_pointee(Objects::default()),
            handlers: RwLock::new(Vec::new()),
            sync_tx,
            epoch: AtomicU64::new(0),
        }
    }

    /// Register a callback sink. Handlers only see changes made after registration.
    pub fn add_event_handler(&self, handler: Arc<dyn ResourceEventHandler>) {
        self.handlers.write().unwrap_or_else(|e| e.into_inner()).push(handler);
    }

    fn handlers(&self) -> Vec<Arc<dyn ResourceEventHandler>> {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn bump(&self, len: usize) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("mirror_objects", len as f64);
    }

    /// Insert or replace an object. Fires `on_add` for a new key, `on_update` otherwise.
    pub fn apply(&self, obj: ResolvedObject) {
        let key = match obj.key() {
            Ok(k) => k,
            Err(e) => {
                warn!(kind = obj.kind(), error = %e, "skipping object without usable key");
                return;
            }
        };
        let obj = Arc::new(obj);
        let prev = self.objects.rcu(|cur| {
            let mut next = Objects::clone(cur);
            next.insert(key.clone(), Arc::clone(&obj));
            next
        });
        let old = prev.get(&key).cloned();
        self.bump(prev.len() + usize::from(old.is_none()));
        metrics::counter!("mirror_events_total", 1u64, "op" => if old.is_some() { "update" } else { "add" });
        for h in self.handlers() {
            match &old {
                Some(old) => h.on_update(old, &obj),
                None => h.on_add(&obj),
            }
        }
    }

    /// Remove an object by key. Fires `on_delete` with the last known state.
    pub fn delete(&self, obj: &ResolvedObject) {
        let Ok(key) = obj.key() else { return };
        let prev = self.objects.rcu(|cur| {
            let mut next = Objects::clone(cur);
            next.remove(&key);
            next
        });
        let Some(gone) = prev.get(&key).cloned() else {
            debug!(key = %key, "delete for unknown object");
            return;
        };
        self.bump(prev.len() - 1);
        metrics::counter!("mirror_events_total", 1u64, "op" => "delete");
        for h in self.handlers() {
            h.on_delete(&gone);
        }
    }

    /// Replace the whole content after a (re)list. Objects missing from `list` are
    /// deleted, the rest applied. The first call marks the mirror as synced.
    pub fn replace(&self, list: Vec<ResolvedObject>) {
        let listed: FxHashMap<ObjectKey, ResolvedObject> = list
            .into_iter()
            .filter_map(|o| match o.key() {
                Ok(k) => Some((k, o)),
                Err(e) => {
                    warn!(error = %e, "skipping listed object without usable key");
                    None
                }
            })
            .collect();
        let current = self.objects.load_full();
        let stale: Vec<Arc<ResolvedObject>> = current
            .iter()
            .filter(|(k, _)| !listed.contains_key(*k))
            .map(|(_, o)| Arc::clone(o))
            .collect();
        let count = listed.len();
        for obj in &stale {
            self.delete(obj);
        }
        for (_, obj) in listed {
            self.apply(obj);
        }
        info!(count, removed = stale.len(), "mirror relisted");
        self.mark_synced();
    }

    fn mark_synced(&self) {
        let changed = self.sync_tx.send_if_modified(|s| {
            if *s == SyncState::Pending {
                *s = SyncState::Synced;
                true
            } else {
                false
            }
        });
        if changed {
            info!(objects = self.len(), "mirror synced");
        }
    }

    /// Record that the initial listing failed. No effect once synced.
    pub fn fail_sync(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.sync_tx.send_if_modified(|s| {
            if *s == SyncState::Pending {
                *s = SyncState::Failed(reason.clone());
                true
            } else {
                false
            }
        });
    }

    /// Wait until the initial listing has been mirrored.
    pub async fn wait_for_sync(&self) -> Result<(), SyncError> {
        let mut rx = self.sync_tx.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                match &*state {
                    SyncState::Synced => return Ok(()),
                    SyncState::Failed(reason) => return Err(SyncError(reason.clone())),
                    SyncState::Pending => {}
                }
            }
            rx.changed().await.map_err(|_| SyncError("mirror dropped".into()))?;
        }
    }

    pub fn is_synced(&self) -> bool {
        *self.sync_tx.borrow() == SyncState::Synced
    }

    /// Monotonic counter of applied changes.
    pub fn epoch(&self) -> u64 { self.epoch.load(Ordering::Relaxed) }

    pub fn len(&self) -> usize { self.objects.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Keys of all mirrored objects, sorted.
    pub fn keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.objects.load().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}

impl ObjectLookup for Mirror {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<ResolvedObject>>, LookupError> {
        let key = ObjectKey::new(namespace, name);
        Ok(self.objects.load().get(&key).cloned())
    }
}
