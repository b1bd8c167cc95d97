//! The node-side RPC server: an HTTPS surface, one route per procedure
//! name, backed by mTLS client-certificate verification against the
//! cluster-shared certificate (§4.1: "server refuses any request not
//! validating against that cert"). Grounded on the teacher's
//! `server/metrics_server.rs` axum-bootstrap shape, generalized from a
//! single `/metrics` route to a generic `/:procedure` dispatch route.

use crate::core::errors::{GanetiError, Result};
use async_trait::async_trait;
use axum::{Router, extract::Path as AxumPath, extract::State, routing::put};
use axum_server::tls_rustls::RustlsConfig;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

/// Implemented by the node backend dispatcher (§4.7): decodes the JSON
/// argument array for one procedure and returns `(success, payload)`.
#[async_trait]
pub trait ProcedureDispatcher: Send + Sync {
    async fn dispatch(&self, procedure: &str, args: Value) -> (bool, Value);
}

async fn handle(
    State(dispatcher): State<Arc<dyn ProcedureDispatcher>>,
    AxumPath(procedure): AxumPath<String>,
    axum::Json(args): axum::Json<Value>,
) -> axum::Json<(bool, Value)> {
    let (success, payload) = dispatcher.dispatch(&procedure, args).await;
    axum::Json((success, payload))
}

/// Builds the rustls server config requiring client certificates to chain
/// to `ca_pem` (mutual TLS, §4.1).
fn build_tls_config(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8]) -> Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GanetiError::Internal(format!("invalid server certificate: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| GanetiError::Internal(format!("invalid server key: {e}")))?
        .ok_or_else(|| GanetiError::Internal("no private key found in key file".into()))?;

    let mut ca_roots = rustls::RootCertStore::empty();
    for ca_cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        let ca_cert = ca_cert.map_err(|e| GanetiError::Internal(format!("invalid CA certificate: {e}")))?;
        ca_roots
            .add(ca_cert)
            .map_err(|e| GanetiError::Internal(format!("failed to add CA root: {e}")))?;
    }
    let client_verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(ca_roots))
        .build()
        .map_err(|e| GanetiError::Internal(format!("failed to build client cert verifier: {e}")))?;

    rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .map_err(|e| GanetiError::Internal(format!("invalid TLS server config: {e}")))
}

/// Runs the node-daemon HTTPS surface until the process is killed. Every
/// request not carrying a client certificate chaining to `ca_pem` is
/// refused at the TLS handshake, before any application code runs.
pub async fn run(
    host: &str,
    port: u16,
    cert_pem: &[u8],
    key_pem: &[u8],
    ca_pem: &[u8],
    dispatcher: Arc<dyn ProcedureDispatcher>,
) -> Result<()> {
    let tls_config = build_tls_config(cert_pem, key_pem, ca_pem)?;
    let rustls_config = RustlsConfig::from_config(Arc::new(tls_config));

    let app = Router::new()
        .route("/{procedure}", put(handle))
        .with_state(dispatcher);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| GanetiError::Internal(format!("invalid listen address: {e}")))?;
    info!(%addr, "node RPC server listening (mTLS)");

    axum_server::bind_rustls(addr, rustls_config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| {
            error!(error = %e, "RPC server terminated");
            GanetiError::Internal(format!("RPC server error: {e}"))
        })
}
