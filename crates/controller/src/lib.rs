//! kube-event-alert controller: the reconciler loop.
//!
//! Mirror callbacks push object keys into the [`ChangeQueue`]; workers pull keys,
//! resolve the current object from the mirror and hand it to an [`AlertHandler`].
//! Success forgets the key's retry state, a retryable failure requeues it with
//! backoff, and a permanent failure drops it.

#![forbid(unsafe_code)]

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use kalert_core::{meta_namespace_key, ObjectKey, ObjectLookup, ResolvedObject, ResourceEventHandler};
use kalert_queue::{ChangeQueue, RateLimiter};
use tracing::{debug, error, info, warn};

mod error;
pub mod handler;

pub use error::ReconcileError;
pub use handler::{AlertHandler, EventHandler, PodHandler};

/// Worker pool that reconciles one kind of object.
pub struct Controller<L, H> {
    name: String,
    lookup: Arc<L>,
    handler: H,
    queue: Arc<ChangeQueue<String>>,
}

impl<L, H> Controller<L, H>
where
    L: ObjectLookup + 'static,
    H: AlertHandler + 'static,
{
    pub fn new(name: &str, lookup: Arc<L>, handler: H) -> Self {
        let queue = ChangeQueue::with_default_rate_limiter(format!("kube-event-alert-{name}"));
        Self::with_queue(name, lookup, handler, queue)
    }

    pub fn with_rate_limiter(
        name: &str,
        lookup: Arc<L>,
        handler: H,
        limiter: impl RateLimiter<String> + 'static,
    ) -> Self {
        let queue = ChangeQueue::new(format!("kube-event-alert-{name}"), limiter);
        Self::with_queue(name, lookup, handler, queue)
    }

    fn with_queue(name: &str, lookup: Arc<L>, handler: H, queue: ChangeQueue<String>) -> Self {
        Self { name: name.to_string(), lookup, handler, queue: Arc::new(queue) }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn queue(&self) -> &Arc<ChangeQueue<String>> { &self.queue }

    /// Callback sink to register with the mirror.
    pub fn event_handler(&self) -> Arc<dyn ResourceEventHandler> {
        Arc::new(Enqueuer { queue: Arc::clone(&self.queue) })
    }

    /// Resolve `key` against the mirror and run the handler on the current state.
    ///
    /// An object that no longer exists is treated as handled: there is nothing
    /// left to alert on.
    pub async fn handle_key(&self, key: &str) -> Result<(), ReconcileError> {
        let ObjectKey { namespace, name } = key.parse::<ObjectKey>()?;
        match self.lookup.get(&namespace, &name)? {
            Some(obj) => self.handler.handle(&obj).await,
            None => {
                debug!(key, "object no longer exists; skipping");
                metrics::counter!("reconcile_not_found_total", 1u64, "controller" => self.name.clone());
                Ok(())
            }
        }
    }

    /// Process one key. Returns `None` once the queue is shut down and drained.
    pub async fn process_next_work_item(&self) -> Option<Result<(), ReconcileError>> {
        let key = self.queue.get().await?;
        let started = Instant::now();

        let res = match AssertUnwindSafe(self.handle_key(&key)).catch_unwind().await {
            Ok(res) => res,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(ReconcileError::Panicked(msg))
            }
        };

        let outcome = match &res {
            Ok(()) => {
                self.queue.forget(&key);
                debug!(key = %key, "handled");
                "ok"
            }
            Err(e) if e.is_permanent() => {
                self.queue.forget(&key);
                error!(key = %key, error = %e, "dropping item; retrying cannot help");
                "dropped"
            }
            Err(e) => {
                let requeues = self.queue.num_requeues(&key);
                warn!(key = %key, error = %e, requeues, "failed to handle; sending back to queue");
                self.queue.add_rate_limited(key.clone());
                "requeued"
            }
        };
        metrics::counter!(
            "reconcile_total", 1u64,
            "controller" => self.name.clone(), "outcome" => outcome
        );
        metrics::histogram!(
            "reconcile_duration_seconds",
            started.elapsed().as_secs_f64(),
            "controller" => self.name.clone()
        );

        self.queue.done(&key);
        Some(res)
    }

    async fn run_worker(self: Arc<Self>, id: usize) {
        debug!(controller = %self.name, worker = id, "worker started");
        while self.process_next_work_item().await.is_some() {}
        debug!(controller = %self.name, worker = id, "worker exited");
    }

    /// Run `workers` concurrent workers until `shutdown` resolves, then stop the
    /// queue and wait for the workers to drain it.
    pub async fn run<F>(self: Arc<Self>, workers: usize, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let workers = workers.max(1);
        info!(controller = %self.name, queue = self.queue.name(), workers, "starting workers");
        let handles: Vec<_> =
            (0..workers).map(|id| tokio::spawn(Arc::clone(&self).run_worker(id))).collect();

        shutdown.await;
        info!(controller = %self.name, pending = self.queue.len(), "stopping workers; draining queue");
        self.queue.shut_down();

        for h in handles {
            if let Err(e) = h.await {
                error!(controller = %self.name, error = %e, "worker task failed");
            }
        }
        info!(controller = %self.name, "workers stopped");
    }
}

fn enqueue(queue: &ChangeQueue<String>, obj: &ResolvedObject) {
    match meta_namespace_key(obj.meta()) {
        Ok(key) => queue.add(key),
        Err(e) => warn!(kind = obj.kind(), error = %e, "cannot compute key; not enqueued"),
    }
}

/// Mirror callback that feeds the queue.
struct Enqueuer {
    queue: Arc<ChangeQueue<String>>,
}

impl ResourceEventHandler for Enqueuer {
    fn on_add(&self, obj: &Arc<ResolvedObject>) {
        enqueue(&self.queue, obj);
    }

    fn on_update(&self, old: &Arc<ResolvedObject>, new: &Arc<ResolvedObject>) {
        // Relists replay unchanged objects; only real changes need another look.
        if old.resource_version().is_some() && old.resource_version() == new.resource_version() {
            return;
        }
        enqueue(&self.queue, new);
    }
}
