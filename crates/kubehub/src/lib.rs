//! kube-event-alert kubehub: client wiring and the watcher that keeps the mirror current

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Pod};
use k8s_openapi::NamespaceResourceScope;
use kalert_core::ResolvedObject;
use kalert_store::Mirror;
use kube::{
    api::Api,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{watcher, WatchStreamExt},
    Client, Config, Resource,
};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Kinds of objects the alerter can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchedKind {
    Event,
    Pod,
}

impl WatchedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Pod => "pod",
        }
    }
}

/// Build a client. An explicit kubeconfig path wins over the inferred config
/// (in-cluster or `$KUBECONFIG`); a master URL overrides the cluster address.
/// With nothing to infer from, a master URL alone is used as a bare config.
pub async fn client(master_url: Option<&str>, kubeconfig: Option<&Path>) -> Result<Client> {
    let master_url = master_url.filter(|u| !u.is_empty());
    let mut config = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?
        }
        None => match (Config::infer().await, master_url) {
            (Ok(config), _) => config,
            (Err(e), Some(url)) => {
                warn!(error = %e, "no kube config found; using master url only");
                Config::new(url.parse().with_context(|| format!("invalid master url {url:?}"))?)
            }
            (Err(e), None) => return Err(e).context("inferring kube config"),
        },
    };
    if let Some(url) = master_url {
        config.cluster_url = url.parse().with_context(|| format!("invalid master url {url:?}"))?;
    }
    info!(cluster = %config.cluster_url, "kube config loaded");
    Client::try_from(config).context("building kube client")
}

/// Namespaced API handle, or cluster-wide when no namespace is given.
pub fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Apply one watcher event to the mirror.
pub fn apply_event<K>(mirror: &Mirror, event: watcher::Event<K>)
where
    ResolvedObject: From<K>,
{
    match event {
        watcher::Event::Applied(o) => mirror.apply(o.into()),
        watcher::Event::Deleted(o) => mirror.delete(&o.into()),
        watcher::Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            mirror.replace(list.into_iter().map(ResolvedObject::from).collect());
        }
    }
}

/// Drive list+watch for `api` into `mirror` until the stream ends.
///
/// An error before the initial listing completes is fatal: the mirror is marked
/// failed and the error returned. Later errors are logged and the watcher retries
/// with backoff.
pub async fn run_watcher<K>(api: Api<K>, mirror: Arc<Mirror>) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    ResolvedObject: From<K>,
{
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!("watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(ev) => apply_event(&mirror, ev),
            Err(e) if !mirror.is_synced() => {
                mirror.fail_sync(e.to_string());
                return Err(e).context("watch failed before initial sync");
            }
            Err(e) => {
                metrics::counter!("watch_errors_total", 1u64);
                warn!(error = %e, "watch error; retrying");
            }
        }
    }
    warn!("watcher stream ended");
    if !mirror.is_synced() {
        mirror.fail_sync("watch stream ended");
        return Err(anyhow!("watch stream ended before initial sync"));
    }
    Ok(())
}

/// Spawn the watcher for `kind` on its own task.
pub fn spawn_watcher(
    kind: WatchedKind,
    client: Client,
    namespace: Option<&str>,
    mirror: Arc<Mirror>,
) -> JoinHandle<Result<()>> {
    info!(kind = kind.as_str(), ns = ?namespace, "starting watcher");
    match kind {
        WatchedKind::Event => tokio::spawn(run_watcher(api::<Event>(client, namespace), mirror)),
        WatchedKind::Pod => tokio::spawn(run_watcher(api::<Pod>(client, namespace), mirror)),
    }
}
