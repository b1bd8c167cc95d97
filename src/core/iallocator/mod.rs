//! The IAllocator bridge (§4.9): serializes cluster state and a placement
//! request into a single JSON document, invokes the external helper script
//! on it, and validates the script's placement decision. Grounded on
//! `examples/original_source/lib/cmdlib.py`'s IAllocator-calling LUs and
//! `lib/rpc.py`'s JSON-over-subprocess conventions.

mod types;

pub use types::{AllocatorInput, AllocatorOutput, AllocatorRequest, ClusterNodeInfo, InstanceInfo};

use crate::core::errors::{GanetiError, Result};
use tokio::process::Command;

/// Invokes `script` with a temp file containing the JSON-encoded
/// `AllocatorInput`, parses its stdout as `AllocatorOutput`, and validates
/// that the returned node count matches what the request demanded.
pub async fn run_allocator(script: &str, input: &AllocatorInput) -> Result<AllocatorOutput> {
    let json = serde_json::to_vec_pretty(input)?;
    let tmp_path = std::env::temp_dir().join(format!("ganeti-iallocator-{}.json", rand::random::<u64>()));
    tokio::fs::write(&tmp_path, &json).await?;

    let run_result = Command::new(script).arg(&tmp_path).output().await;
    let cleanup = tokio::fs::remove_file(&tmp_path).await;
    if let Err(e) = cleanup {
        tracing::warn!(path = %tmp_path.display(), error = %e, "failed to remove iallocator temp file");
    }

    let output = run_result.map_err(|e| GanetiError::ExecError(format!("failed to invoke iallocator '{script}': {e}")))?;
    if !output.status.success() {
        return Err(GanetiError::ExecError(format!(
            "iallocator '{}' exited with {}: {}",
            script,
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let parsed: AllocatorOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| GanetiError::ExecError(format!("iallocator produced invalid JSON: {e}")))?;

    if !parsed.success {
        return Err(GanetiError::ExecError(format!(
            "iallocator declined allocation: {}",
            parsed.info
        )));
    }

    let required = match &input.request {
        AllocatorRequest::Allocate { required_nodes, .. } => Some(*required_nodes),
        AllocatorRequest::Relocate { required_nodes, .. } => Some(*required_nodes),
    };
    if let Some(required) = required {
        if parsed.nodes.len() != required {
            return Err(GanetiError::ExecError(format!(
                "iallocator returned {} nodes, required_nodes was {}",
                parsed.nodes.len(),
                required
            )));
        }
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_request_serializes_with_type_tag() {
        let req = AllocatorRequest::Allocate {
            name: "i.example.com".into(),
            disk_template: "drbd8".into(),
            tags: vec![],
            os: "noop".into(),
            vcpus: 1,
            memory: 512,
            disks: vec![1024],
            disk_space_total: 1024,
            nics: vec![],
            required_nodes: 2,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "allocate");
        assert_eq!(json["required_nodes"], 2);
    }
}
