//! Process bootstrap for both roles the binary can run as (§2, §5):
//! master (cluster config store, lock manager, processor, watcher) or
//! node-daemon (the RPC server fronting `NodeBackend`). Grounded on the
//! teacher's `src/server/mod.rs` + `src/server/metrics_server.rs`
//! orchestration shape, generalized from a single-role server bootstrap
//! to a `Role::Master | Role::NodeDaemon` dispatch, and on
//! `src/main.rs`'s `--warden` dual-mode flag handling for the idea of one
//! binary with two runtime personalities selected at startup.

use crate::config::{Config, Role};
use crate::core::backend::NodeBackend;
use crate::core::cluster_config::{ClusterConfigStore, ClusterIdentity};
use crate::core::errors::{GanetiError, Result};
use crate::core::jobqueue::JobQueue;
use crate::core::locking::LockManager;
use crate::core::lu::LuContext;
use crate::core::metrics::gather_metrics;
use crate::core::processor::Processor;
use crate::core::rpc::{self, RpcClient};
use crate::core::watcher;
use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Dispatches to the role-appropriate bootstrap. Both branches spawn the
/// metrics server (if enabled) before blocking on their main loop.
pub async fn run(config: Config) -> Result<()> {
    match config.role {
        Role::Master => run_master(config).await,
        Role::NodeDaemon => run_node_daemon(config).await,
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| GanetiError::Internal(format!("failed to read '{path}': {e}")))
}

/// Starts the master process: loads (or bootstraps) the authoritative
/// cluster config, builds the lock manager, RPC client, job queue and
/// processor, spawns the watcher's reconciliation loop, and blocks
/// forever. Job submission is left to the RAPI/CLI surface, which is an
/// explicit Non-goal (§1) — this function brings up everything that
/// surface would call into.
async fn run_master(config: Config) -> Result<()> {
    info!("starting in MASTER role");
    let config_file_path = format!("{}/config.json", config.paths.jobqueue_dir);

    let cluster_config = match ClusterConfigStore::load_config(
        &config_file_path,
        config.drbd.port_low,
        config.drbd.port_high,
    ) {
        Ok(store) => {
            info!(path = %config_file_path, "loaded existing cluster config");
            store
        }
        Err(e) => {
            info!(error = %e, "no existing cluster config found, starting with an empty one");
            let identity = ClusterIdentity {
                cluster_name: config.host.clone(),
                master_node: config.host.clone(),
                master_ip: config.host.clone(),
                master_netdev: "eth0".to_string(),
                enabled_hypervisors: vec!["kvm".to_string()],
                file_storage_roots: config.paths.file_storage_roots.clone(),
                uid_pool: Vec::new(),
                drbd_usermode_helper: config.drbd.usermode_helper.clone(),
                tags: Default::default(),
            };
            ClusterConfigStore::new(
                identity,
                config.drbd.port_low,
                config.drbd.port_high,
                config_file_path,
            )
        }
    };
    let cluster_config = Arc::new(cluster_config);

    let cert_pem = read_pem(&config.tls.cert_path)?;
    let key_pem = read_pem(&config.tls.key_path)?;
    let ca_pem = read_pem(&config.tls.ca_path)?;
    let rpc_client = Arc::new(RpcClient::new(&cert_pem, &key_pem, &ca_pem, config.port)?);

    let lock_manager = Arc::new(LockManager::new());
    let settings = Arc::new(config.clone());
    let jobs = Arc::new(JobQueue::new());
    let processor = Arc::new(Processor::new(
        cluster_config.clone(),
        lock_manager.clone(),
        rpc_client.clone(),
        settings.clone(),
    ));

    let ctx = LuContext {
        config: cluster_config.clone(),
        locks: lock_manager,
        rpc: rpc_client,
        settings,
    };

    if config.metrics.enabled {
        tokio::spawn(run_metrics_server(config.metrics.port));
    }

    watcher::run(ctx, jobs, processor).await;
    Ok(())
}

/// Starts the node-daemon process: builds the `NodeBackend` dispatcher
/// and runs the mTLS RPC server until killed (§4.7).
async fn run_node_daemon(config: Config) -> Result<()> {
    info!("starting in NODE-DAEMON role");
    let cert_pem = read_pem(&config.tls.cert_path)?;
    let key_pem = read_pem(&config.tls.key_path)?;
    let ca_pem = read_pem(&config.tls.ca_path)?;

    let dispatcher = Arc::new(NodeBackend::new(config.paths.clone()));

    if config.metrics.enabled {
        tokio::spawn(run_metrics_server(config.metrics.port));
    }

    rpc::run_server(&config.host, config.port, &cert_pem, &key_pem, &ca_pem, dispatcher).await
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

/// Plain-HTTP (no mTLS — metrics are an operational, not cluster-trust,
/// surface) exporter for Prometheus scraping, mirroring the teacher's
/// `/metrics` route shape.
async fn run_metrics_server(port: u16) {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "Prometheus metrics server listening on /metrics");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind metrics server");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "metrics server terminated");
    }
}
