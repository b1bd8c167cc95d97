//! The master-side RPC client (§4.1): a process-wide, long-lived mTLS
//! HTTPS client that fans a single call out to a set of nodes in parallel.
//! Grounded on the teacher's `core::cluster::gossip` fan-out-to-known-nodes
//! shape, generalized from UDP datagrams to HTTPS PUT request/response.

use crate::core::errors::{GanetiError, Result};
use crate::core::metrics;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One node to fan a call out to. `offline` is the derived liveness from
/// `cluster_config::Node` (§3): when true, the call is never attempted.
#[derive(Debug, Clone)]
pub struct NodeTarget {
    pub name: String,
    pub address: String,
    pub offline: bool,
}

/// Per-node outcome of one RPC call (§4.1). There is no RPC-level retry —
/// that is a caller concern.
#[derive(Debug, Clone)]
pub enum NodeResult {
    Ok(Value),
    Failed(String),
    Offline,
}

impl NodeResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, NodeResult::Ok(_))
    }

    pub fn into_value(self) -> Result<Value> {
        match self {
            NodeResult::Ok(v) => Ok(v),
            NodeResult::Failed(msg) => Err(GanetiError::RpcError {
                node: String::new(),
                message: msg,
            }),
            NodeResult::Offline => Err(GanetiError::RpcError {
                node: String::new(),
                message: "node is offline".into(),
            }),
        }
    }
}

/// The process-wide RPC client. One instance per master process; safe to
/// share across concurrent jobs (`reqwest::Client` is pool-backed and
/// `Clone`-cheap).
#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
    port: u16,
    call_timeout: Duration,
}

impl RpcClient {
    /// Builds the client with the cluster-shared mTLS identity. `cert_pem`
    /// and `key_pem` form the client certificate presented to every node;
    /// `ca_pem` is the trust anchor nodes' server certificates are
    /// validated against (typically the same cluster-shared certificate,
    /// used as its own CA, per §4.1).
    pub fn new(cert_pem: &[u8], key_pem: &[u8], ca_pem: &[u8], port: u16) -> Result<Self> {
        let mut identity_pem = Vec::with_capacity(cert_pem.len() + key_pem.len());
        identity_pem.extend_from_slice(cert_pem);
        identity_pem.extend_from_slice(key_pem);
        let identity = reqwest::Identity::from_pem(&identity_pem)
            .map_err(|e| GanetiError::Internal(format!("invalid client TLS identity: {e}")))?;
        let ca_cert = reqwest::Certificate::from_pem(ca_pem)
            .map_err(|e| GanetiError::Internal(format!("invalid CA certificate: {e}")))?;
        let http = reqwest::Client::builder()
            .identity(identity)
            .add_root_certificate(ca_cert)
            .use_rustls_tls()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| GanetiError::Internal(format!("failed to build RPC client: {e}")))?;
        Ok(Self {
            http,
            port,
            call_timeout: Duration::from_secs(300),
        })
    }

    /// Calls `procedure` with `args` on every target in `nodes`, in
    /// parallel, returning one `NodeResult` per node name. Offline nodes
    /// short-circuit without a network attempt (§4.1).
    pub async fn call<T: Serialize>(
        &self,
        procedure: &str,
        args: &T,
        nodes: &[NodeTarget],
    ) -> HashMap<String, NodeResult> {
        let body = match serde_json::to_value(args) {
            Ok(b) => b,
            Err(e) => {
                return nodes
                    .iter()
                    .map(|n| (n.name.clone(), NodeResult::Failed(format!("failed to encode request: {e}"))))
                    .collect();
            }
        };

        let started = Instant::now();
        let futures = nodes.iter().map(|node| self.call_one(procedure, &body, node));
        let results = join_all(futures).await;

        let outcomes: Vec<&str> = results
            .iter()
            .map(|r| match r {
                NodeResult::Ok(_) => "ok",
                NodeResult::Failed(_) => "failed",
                NodeResult::Offline => "offline",
            })
            .collect();
        metrics::record_rpc_call(procedure, started.elapsed(), &outcomes);

        nodes
            .iter()
            .zip(results)
            .map(|(node, result)| (node.name.clone(), result))
            .collect()
    }

    async fn call_one(&self, procedure: &str, body: &Value, node: &NodeTarget) -> NodeResult {
        if node.offline {
            return NodeResult::Offline;
        }
        let url = format!("https://{}:{}/{}", node.address, self.port, procedure);
        let response = match self
            .http
            .put(&url)
            .json(body)
            .timeout(self.call_timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return NodeResult::Failed(format!("transport error: {e}")),
        };
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return NodeResult::Failed(format!("HTTP {status}: {text}"));
        }
        let outer: (bool, Value) = match response.json().await {
            Ok(v) => v,
            Err(e) => return NodeResult::Failed(format!("invalid response body: {e}")),
        };
        let (success, payload) = outer;
        if success {
            NodeResult::Ok(payload)
        } else {
            let msg = payload.as_str().map(str::to_string).unwrap_or_else(|| payload.to_string());
            NodeResult::Failed(msg)
        }
    }
}
