//! The external-process boundary (§9): LVM, `drbdsetup`, and
//! `blockdev` are invoked as subprocesses whose output is captured bounded.
//! Errors are classified by parsing known patterns; anything unrecognized
//! becomes a generic error carrying the subprocess output verbatim.

use crate::core::errors::{GanetiError, Result};
use tokio::process::Command;

/// Caps captured stdout/stderr so a runaway subprocess can't exhaust
/// memory; large enough that no real LVM/DRBD tool output is truncated in
/// practice.
const MAX_CAPTURE_BYTES: usize = 256 * 1024;

pub struct ProcessOutput {
    pub status_ok: bool,
    pub stdout: String,
    pub stderr: String,
}

fn truncate_utf8_lossy(bytes: &[u8]) -> String {
    let capped = if bytes.len() > MAX_CAPTURE_BYTES {
        &bytes[..MAX_CAPTURE_BYTES]
    } else {
        bytes
    };
    String::from_utf8_lossy(capped).into_owned()
}

/// Runs `cmd args...`, capturing bounded stdout/stderr. Does not itself
/// interpret the exit code — callers classify failures against
/// tool-specific patterns.
pub async fn run(cmd: &str, args: &[&str]) -> Result<ProcessOutput> {
    let output = Command::new(cmd)
        .args(args)
        .output()
        .await
        .map_err(|e| GanetiError::BlockDeviceError(format!("failed to spawn '{cmd}': {e}")))?;
    Ok(ProcessOutput {
        status_ok: output.status.success(),
        stdout: truncate_utf8_lossy(&output.stdout),
        stderr: truncate_utf8_lossy(&output.stderr),
    })
}

/// Runs a command and turns a non-zero exit into a `BlockDeviceError`
/// carrying the captured output verbatim (the "generic error" fallback
/// from the external-process-boundary design note).
pub async fn run_checked(cmd: &str, args: &[&str]) -> Result<String> {
    let out = run(cmd, args).await?;
    if !out.status_ok {
        return Err(GanetiError::BlockDeviceError(format!(
            "'{} {}' failed: {}{}",
            cmd,
            args.join(" "),
            out.stdout,
            out.stderr
        )));
    }
    Ok(out.stdout)
}
