// src/core/mod.rs

//! The central module containing the core logic and data structures of the
//! cluster manager.

pub mod backend;
pub mod bdev;
pub mod cluster_config;
pub mod errors;
pub mod hooks;
pub mod hypervisor;
pub mod iallocator;
pub mod jobqueue;
pub mod locking;
pub mod lu;
pub mod metrics;
pub mod opcodes;
pub mod processor;
pub mod rpc;
pub mod watcher;

pub use errors::{GanetiError, Result};
