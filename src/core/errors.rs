// src/core/errors.rs

//! Defines the primary error type for the entire application.

use thiserror::Error;

/// The main error enum, representing all possible failures within the cluster
/// manager. Using `thiserror` allows for clean error definitions and automatic
/// `From` trait implementations, the way the rest of the ecosystem does it.
#[derive(Error, Debug, Clone)]
pub enum GanetiError {
    /// Raised from `CheckPrereq`. The opcode never mutates state once this is
    /// raised; it is surfaced to the caller with a specific error code.
    #[error("prerequisite check failed: {0}")]
    PrereqError(String),

    /// Raised from `Exec`, after mutations may already have occurred. The job
    /// fails; there is no automatic rollback at the LU boundary.
    #[error("execution failed: {0}")]
    ExecError(String),

    /// Propagated from the hypervisor capability contract.
    #[error("hypervisor error: {0}")]
    HypervisorError(String),

    /// Propagated from the block-device layer. Structural failures only —
    /// recoverable conditions (attach-where-already-assembled,
    /// detach-where-already-detached) are absorbed as warnings by the caller,
    /// not represented here.
    #[error("block device error: {0}")]
    BlockDeviceError(String),

    /// A per-node RPC failure. Carries the node name for attribution.
    #[error("RPC error on node {node}: {message}")]
    RpcError { node: String, message: String },

    /// The cluster configuration changed mid-operation (optimistic
    /// concurrency); the caller should re-submit the opcode.
    #[error("retry required: {0}")]
    RetryRequired(String),

    /// A lock was deleted out from under a waiter, or an acquire timed out.
    #[error("locking error: {0}")]
    LockingError(String),

    /// A lock-ordering violation: acquiring a level-i lock while holding a
    /// level-j<i lock. This is a programming error, not a runtime condition.
    #[error("lock order violation: {0}")]
    LockOrderViolation(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("TOML error: {0}")]
    Toml(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for GanetiError {
    fn from(e: std::io::Error) -> Self {
        GanetiError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for GanetiError {
    fn from(e: reqwest::Error) -> Self {
        GanetiError::HttpClient(e.to_string())
    }
}

impl From<serde_json::Error> for GanetiError {
    fn from(e: serde_json::Error) -> Self {
        GanetiError::Json(e.to_string())
    }
}

impl From<toml::de::Error> for GanetiError {
    fn from(e: toml::de::Error) -> Self {
        GanetiError::Toml(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GanetiError>;
