use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::builder::NonEmptyStringValueParser;
use clap::{ArgAction, Parser, ValueEnum};
use kalert_kubehub::WatchedKind;
use kalert_notify::DEFAULT_USERNAME;

mod launch;

/// Watch Kubernetes events or pods and post alerts to a webhook.
#[derive(Parser, Debug)]
#[command(name = "kube-event-alert", version)]
pub struct Config {
    /// Path to a kubeconfig file; in-cluster or default config when unset.
    #[arg(long, env = "KUBECONFIG_PATH")]
    kubeconfig: Option<PathBuf>,
    /// API server URL, overriding the one from the kubeconfig.
    #[arg(long, env = "KUBE_MASTER_URL")]
    master_url: Option<String>,
    /// Webhook receiving the alerts.
    #[arg(long, env = "WEBHOOK_URL", value_parser = NonEmptyStringValueParser::new())]
    webhook_url: String,
    #[arg(long, value_enum, default_value_t = Resource::Event)]
    resource: Resource,
    /// Namespace to watch; all namespaces when unset.
    #[arg(long)]
    namespace: Option<String>,
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Display name sent with each message.
    #[arg(long, default_value = DEFAULT_USERNAME)]
    username: String,
    /// Send text only (plain Slack incoming webhook).
    #[arg(long, action = ArgAction::SetTrue)]
    no_username: bool,
    /// Per-delivery HTTP timeout.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
    /// Emit logs as JSON lines.
    #[arg(long, action = ArgAction::SetTrue)]
    log_json: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Resource {
    Event,
    Pod,
}

impl From<Resource> for WatchedKind {
    fn from(r: Resource) -> Self {
        match r {
            Resource::Event => WatchedKind::Event,
            Resource::Pod => WatchedKind::Pod,
        }
    }
}

fn init_tracing(json: bool) {
    let env = std::env::var("KALERT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KALERT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KALERT_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_tracing(cfg.log_json);
    init_metrics();
    launch::run(cfg).await
}
