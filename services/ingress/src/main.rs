//! qumine ingress
//!
//! Accepts Minecraft connections on one port and forwards each one to the
//! server named in its handshake.
//!
//! This service:
//! - Installs static routes from the command line
//! - Watches annotated Kubernetes services for more routes
//! - Proxies connections to the matching backend
//! - Serves health, metrics and the route table over HTTP

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use qumine_ingress::api::{self, ApiState};
use qumine_ingress::config::{Config, KubeMode};
use qumine_ingress::kube::{KubeClient, KubeClientConfig, Watcher};
use qumine_ingress::{metrics, sync, ComponentStatus, Listener, RouteTable};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const ROUTE_EVENT_BUFFER: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();

    // Prefer RUST_LOG, fall back to --debug/--trace
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting qumine ingress");
    info!(
        listen_addr = %config.listen_addr(),
        api_addr = %config.api_addr(),
        kube_mode = ?config.kube_mode,
        namespace = config.namespace.as_deref().unwrap_or("*"),
        static_routes = config.routes.len(),
        "Configuration loaded"
    );

    let prometheus = metrics::install().context("Failed to install metrics recorder")?;

    let route_table = Arc::new(RouteTable::new());
    sync::install_static_routes(&route_table, &config.routes)
        .context("Invalid static route")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_status = Arc::new(ComponentStatus::new());
    let listener = Listener::bind(
        config.listener_config(),
        Arc::clone(&route_table),
        Arc::clone(&server_status),
    )
    .await
    .with_context(|| format!("Failed to bind listener on {}", config.listen_addr()))?;

    let mut api_state = ApiState::new(Arc::clone(&route_table), prometheus)
        .with_component("server", Arc::clone(&server_status));

    let mut handles = Vec::new();

    let (events_tx, events_rx) = mpsc::channel(ROUTE_EVENT_BUFFER);
    if let Some(client_config) = kube_client_config(&config)? {
        let client = KubeClient::new(client_config).context("Failed to build Kubernetes client")?;
        let kube_status = Arc::new(ComponentStatus::new());
        api_state = api_state.with_component("k8s", Arc::clone(&kube_status));

        let watcher = Watcher::new(client, events_tx, kube_status);
        handles.push(tokio::spawn(watcher.run(shutdown_rx.clone())));
    } else {
        info!("Kubernetes discovery disabled");
        drop(events_tx);
    }

    handles.push(tokio::spawn(sync::run_route_sync_loop(
        Arc::clone(&route_table),
        events_rx,
        shutdown_rx.clone(),
    )));

    handles.push(tokio::spawn(listener.run(shutdown_rx.clone())));

    let mut api_handle = tokio::spawn(api::serve(config.api_addr(), api_state, shutdown_rx));

    let mut api_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut api_handle => {
            api_done = true;
            match result {
                Ok(Ok(())) => info!("Admin API exited"),
                Ok(Err(e)) => error!(error = %e, "Admin API failed"),
                Err(e) => error!(error = %e, "Admin API task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if !api_done {
        handles.push(tokio::spawn(async move {
            if let Ok(Err(e)) = api_handle.await {
                error!(error = %e, "Admin API failed");
            }
        }));
    }
    let drain = futures_util::future::join_all(handles);
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        error!("Workers did not stop within the grace period");
    }

    info!("Ingress shutdown complete");
    Ok(())
}

fn kube_client_config(config: &Config) -> Result<Option<KubeClientConfig>> {
    let namespace = config.namespace.clone();
    let client_config = match config.kube_mode {
        KubeMode::Disabled => return Ok(None),
        KubeMode::InCluster => {
            let mut client_config = KubeClientConfig::in_cluster(namespace)
                .context("Not running inside a Kubernetes cluster")?;
            if let Some(path) = &config.kube_token_file {
                client_config.token_file = Some(path.clone());
            }
            if let Some(path) = &config.kube_ca_file {
                client_config.ca_file = Some(path.clone());
            }
            client_config
        }
        KubeMode::Url => KubeClientConfig {
            base_url: config
                .kube_api_url
                .clone()
                .context("--kube-api-url is required in url mode")?,
            token_file: config.kube_token_file.clone(),
            ca_file: config.kube_ca_file.clone(),
            namespace,
        },
    };
    Ok(Some(client_config))
}
