//! The RPC transport (§4.1): a long-lived mTLS HTTPS client in the master
//! process fanning calls out in parallel to node daemons, and the HTTPS
//! server each node daemon runs to receive them.

mod client;
mod envelope;
mod server;

pub use client::{NodeResult, NodeTarget, RpcClient};
pub use envelope::{COMPRESSION_THRESHOLD, Encoding, Envelope};
pub use server::{ProcedureDispatcher, run as run_server};
