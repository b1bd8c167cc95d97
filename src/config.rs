// src/config.rs

//! Manages process configuration: loading, resolving dynamic values, and
//! validation. This is the per-process (master or node-daemon) bootstrap
//! configuration; the authoritative cluster-wide configuration (nodes,
//! instances, disks) lives in `core::cluster_config`.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::warn;

/// Which role this process runs as.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Runs the Logical Unit framework, lock manager, processor, and
    /// IAllocator bridge; holds the authoritative cluster configuration.
    Master,
    /// Runs the node backend dispatcher behind the RPC transport's HTTPS
    /// server; has no cluster-wide state of its own.
    NodeDaemon,
}

impl Default for Role {
    fn default() -> Self {
        Role::NodeDaemon
    }
}

/// TLS / mTLS settings for the RPC transport. The cluster uses a single
/// shared certificate for mutual authentication between master and nodes
/// (§4.1): the server refuses any request that doesn't validate against it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
    /// CA bundle used to validate peer certificates. For the cluster-shared
    /// certificate scheme this is typically the same certificate as
    /// `cert_path`, used as its own trust anchor.
    pub ca_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            ca_path: default_ca_path(),
        }
    }
}

fn default_cert_path() -> String {
    "cluster.crt".to_string()
}
fn default_key_path() -> String {
    "cluster.key".to_string()
}
fn default_ca_path() -> String {
    "cluster.crt".to_string()
}

/// Paths the node backend and hooks runner need on disk.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PathsConfig {
    /// Roots under which file-backed and shared-file disk templates may
    /// place their backing files.
    #[serde(default = "default_file_storage_roots")]
    pub file_storage_roots: Vec<String>,
    /// Base directory hooks are scanned from: `<base>/<hook_path>-<phase>.d`.
    #[serde(default = "default_hooks_base_dir")]
    pub hooks_base_dir: String,
    /// Directory the node-local dev cache files live in.
    #[serde(default = "default_bdev_cache_dir")]
    pub bdev_cache_dir: String,
    /// Directory export/import archives are published under.
    #[serde(default = "default_export_dir")]
    pub export_dir: String,
    /// Path to the external IAllocator helper script.
    #[serde(default = "default_iallocator_script")]
    pub iallocator_script: String,
    /// Base directory for the in-memory job queue's status snapshots.
    #[serde(default = "default_jobqueue_dir")]
    pub jobqueue_dir: String,
}

fn default_file_storage_roots() -> Vec<String> {
    vec!["/srv/ganeti/file-storage".to_string()]
}
fn default_hooks_base_dir() -> String {
    "/etc/ganeti/hooks".to_string()
}
fn default_bdev_cache_dir() -> String {
    "/var/run/ganeti/bdev-cache".to_string()
}
fn default_export_dir() -> String {
    "/srv/ganeti/export".to_string()
}
fn default_iallocator_script() -> String {
    "/usr/local/sbin/ganeti-iallocator-hail".to_string()
}
fn default_jobqueue_dir() -> String {
    "/var/lib/ganeti/queue".to_string()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            file_storage_roots: default_file_storage_roots(),
            hooks_base_dir: default_hooks_base_dir(),
            bdev_cache_dir: default_bdev_cache_dir(),
            export_dir: default_export_dir(),
            iallocator_script: default_iallocator_script(),
            jobqueue_dir: default_jobqueue_dir(),
        }
    }
}

/// DRBD-specific process settings: the port range the monotonic port
/// allocator in `cluster_config` draws from, and the usermode helper.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DrbdConfig {
    #[serde(default = "default_port_low")]
    pub port_low: u16,
    #[serde(default = "default_port_high")]
    pub port_high: u16,
    #[serde(default = "default_usermode_helper")]
    pub usermode_helper: String,
}

fn default_port_low() -> u16 {
    11000
}
fn default_port_high() -> u16 {
    14999
}
fn default_usermode_helper() -> String {
    "/bin/true".to_string()
}

impl Default for DrbdConfig {
    fn default() -> Self {
        Self {
            port_low: default_port_low(),
            port_high: default_port_high(),
            usermode_helper: default_usermode_helper(),
        }
    }
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8989
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    role: Role,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    paths: PathsConfig,
    #[serde(default)]
    drbd: DrbdConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    1811
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Represents the final, validated, and resolved process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub role: Role,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub tls: TlsConfig,
    pub paths: PathsConfig,
    pub drbd: DrbdConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::default(),
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            tls: TlsConfig::default(),
            paths: PathsConfig::default(),
            drbd: DrbdConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let config = Config {
            role: raw.role,
            host: raw.host,
            port: raw.port,
            log_level: raw.log_level,
            tls: raw.tls,
            paths: raw.paths,
            drbd: raw.drbd,
            metrics: raw.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(anyhow!("port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        if self.tls.cert_path.trim().is_empty() || self.tls.key_path.trim().is_empty() {
            return Err(anyhow!(
                "tls.cert_path and tls.key_path are required (the RPC transport is mTLS-only)"
            ));
        }
        if self.drbd.port_low >= self.drbd.port_high {
            return Err(anyhow!(
                "drbd.port_low ({}) must be less than drbd.port_high ({})",
                self.drbd.port_low,
                self.drbd.port_high
            ));
        }
        if self.paths.file_storage_roots.is_empty() {
            warn!(
                "no file_storage_roots configured; file/shared-file disk templates will be unusable"
            );
        }
        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(anyhow!("metrics.port cannot be 0"));
            }
            if self.metrics.port == self.port {
                return Err(anyhow!(
                    "metrics.port cannot be the same as the main server port"
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_drbd_port_range() {
        let mut cfg = Config::default();
        cfg.drbd.port_low = 15000;
        cfg.drbd.port_high = 11000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_metrics_port_collision_with_main_port() {
        let mut cfg = Config::default();
        cfg.metrics.enabled = true;
        cfg.metrics.port = cfg.port;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_tls_paths() {
        let mut cfg = Config::default();
        cfg.tls.cert_path = String::new();
        assert!(cfg.validate().is_err());
    }
}
