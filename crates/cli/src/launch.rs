//! Wiring: kube client, mirror, watcher, controller, and signal handling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use kalert_controller::{AlertHandler, Controller, EventHandler, PodHandler};
use kalert_kubehub::{spawn_watcher, WatchedKind};
use kalert_notify::{Notifier, WebhookNotifier};
use kalert_store::Mirror;
use tokio::signal;
use tracing::{error, info, warn};

use crate::Config;

pub async fn run(cfg: Config) -> Result<()> {
    let kind = WatchedKind::from(cfg.resource);
    let notifier = notifier(&cfg)?;
    let client = kalert_kubehub::client(cfg.master_url.as_deref(), cfg.kubeconfig.as_deref()).await?;
    let mirror = Arc::new(Mirror::new());

    match kind {
        WatchedKind::Event => serve(&cfg, kind, client, mirror, EventHandler::new(notifier)).await,
        WatchedKind::Pod => serve(&cfg, kind, client, mirror, PodHandler::new(notifier)).await,
    }
}

fn notifier(cfg: &Config) -> Result<Arc<dyn Notifier>> {
    let username = (!cfg.no_username).then(|| cfg.username.clone());
    let webhook = WebhookNotifier::new(cfg.webhook_url.clone())
        .with_username(username)
        .with_timeout(Duration::from_secs(cfg.timeout_secs))
        .context("building webhook client")?;
    Ok(Arc::new(webhook))
}

async fn serve<H>(cfg: &Config, kind: WatchedKind, client: kube::Client, mirror: Arc<Mirror>, handler: H) -> Result<()>
where
    H: AlertHandler + 'static,
{
    let controller = Arc::new(Controller::new(kind.as_str(), Arc::clone(&mirror), handler));
    // Registered before the watcher starts so the initial listing is enqueued too.
    mirror.add_event_handler(controller.event_handler());
    let mut watcher = spawn_watcher(kind, client, cfg.namespace.as_deref(), Arc::clone(&mirror));

    tokio::select! {
        res = mirror.wait_for_sync() => res.context("initial sync failed")?,
        res = &mut watcher => return Err(watcher_exit(res).context("watcher stopped before initial sync")),
    }
    info!(controller = controller.name(), objects = mirror.len(), "mirror synced; starting workers");

    let mut watcher_failure = None;
    let stop = async {
        tokio::select! {
            _ = shutdown_signal() => {}
            res = &mut watcher => {
                let err = watcher_exit(res);
                error!(error = %err, "watcher stopped; shutting down");
                watcher_failure = Some(err);
            }
        }
    };
    Arc::clone(&controller).run(cfg.workers, stop).await;
    watcher.abort();

    match watcher_failure {
        Some(err) => Err(err.context("watcher failed")),
        None => {
            info!("shutdown complete");
            Ok(())
        }
    }
}

fn watcher_exit(res: Result<Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    match res {
        Ok(Ok(())) => anyhow!("watch stream ended"),
        Ok(Err(e)) => e,
        Err(e) => anyhow!(e).context("watcher task aborted"),
    }
}

/// Resolves on the first SIGINT/SIGTERM. A second one exits the process at once.
async fn shutdown_signal() {
    wait_for_signal().await;
    info!("shutdown signal received; draining queue (repeat to force exit)");
    tokio::spawn(async {
        wait_for_signal().await;
        warn!("second shutdown signal; exiting immediately");
        std::process::exit(1);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};
    match unix_signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM; only Ctrl-C stops the process");
            let _ = signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = signal::ctrl_c().await;
}
