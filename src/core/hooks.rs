//! The hooks runner (§4.8): scans `<base_dir>/<hook_path>-<phase>.d` for
//! executable scripts, runs each with a sanitized environment, and
//! captures bounded output. Grounded on
//! `examples/original_source/lib/backend.py`'s `RunLocalHooks`/hooks
//! section for the directory-scan and naming-filter behavior, and on the
//! crate's own `core::bdev::process` external-process-boundary idiom for
//! "shell out, capture bounded output".

use crate::core::errors::Result;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::warn;

/// Scripts must match this name pattern and be a regular executable file.
static VALID_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

/// At most this much of merged stdout+stderr is captured per script (§4.8).
const MAX_HOOK_OUTPUT_BYTES: usize = 4 * 1024;

const HOOK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    fn as_str(self) -> &'static str {
        match self {
            HookPhase::Pre => "pre",
            HookPhase::Post => "post",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    Success,
    Fail,
    Skip,
}

#[derive(Debug, Clone)]
pub struct ScriptResult {
    pub name: String,
    pub outcome: ScriptOutcome,
    pub output: String,
}

/// One LU's hooks invocation context: the opcode name and the environment
/// variables it contributes on top of the `GANETI_*` framing variables
/// (§4.8, §6).
#[derive(Debug, Clone)]
pub struct HookEnv {
    pub op_code: String,
    pub hook_path: String,
    pub extra: BTreeMap<String, String>,
}

impl HookEnv {
    fn build(&self, phase: HookPhase) -> Vec<(String, String)> {
        let mut env = vec![
            ("GANETI_HOOKS_VERSION".to_string(), "2".to_string()),
            ("GANETI_OP_CODE".to_string(), self.op_code.clone()),
            ("GANETI_HOOKS_PHASE".to_string(), phase.as_str().to_string()),
            ("GANETI_HOOKS_PATH".to_string(), self.hook_path.clone()),
        ];
        for (k, v) in &self.extra {
            env.push((k.clone(), v.clone()));
        }
        env
    }
}

/// Runs every matching script under `<base_dir>/<hook_path>-<phase>.d`, in
/// lexicographic order (so `00prefix` sorts first), with stdin=/dev/null,
/// cwd=/, and the environment from `env` plus the `GANETI_*` framing
/// variables (§4.8).
pub async fn run_phase(base_dir: &Path, env: &HookEnv, phase: HookPhase) -> Result<Vec<ScriptResult>> {
    let dir = base_dir.join(format!("{}-{}.d", env.hook_path, phase.as_str()));
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        names.push(name);
    }
    names.sort();

    let mut results = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(&name);
        results.push(run_one(&path, &name, env, phase).await);
    }
    Ok(results)
}

async fn run_one(path: &PathBuf, name: &str, env: &HookEnv, phase: HookPhase) -> ScriptResult {
    if !VALID_NAME.is_match(name) {
        return ScriptResult {
            name: name.to_string(),
            outcome: ScriptOutcome::Skip,
            output: "name does not match ^[A-Za-z0-9_-]+$".to_string(),
        };
    }
    let meta = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) => {
            return ScriptResult {
                name: name.to_string(),
                outcome: ScriptOutcome::Skip,
                output: format!("stat failed: {e}"),
            };
        }
    };
    #[cfg(unix)]
    let is_executable = {
        use std::os::unix::fs::PermissionsExt;
        meta.is_file() && meta.permissions().mode() & 0o111 != 0
    };
    #[cfg(not(unix))]
    let is_executable = meta.is_file();
    if !is_executable {
        return ScriptResult {
            name: name.to_string(),
            outcome: ScriptOutcome::Skip,
            output: "not a regular executable file".to_string(),
        };
    }

    let mut cmd = Command::new(path);
    cmd.current_dir("/")
        .stdin(std::process::Stdio::null())
        .env_clear();
    for (k, v) in env.build(phase) {
        cmd.env(k, v);
    }

    let outcome_fut = cmd.output();
    let output = match tokio::time::timeout(HOOK_TIMEOUT, outcome_fut).await {
        Ok(Ok(out)) => out,
        Ok(Err(e)) => {
            return ScriptResult {
                name: name.to_string(),
                outcome: ScriptOutcome::Fail,
                output: format!("failed to execute: {e}"),
            };
        }
        Err(_) => {
            warn!(script = %name, "hook script timed out");
            return ScriptResult {
                name: name.to_string(),
                outcome: ScriptOutcome::Fail,
                output: "timed out".to_string(),
            };
        }
    };

    let mut merged = output.stdout;
    merged.extend_from_slice(&output.stderr);
    merged.truncate(MAX_HOOK_OUTPUT_BYTES);
    let text = String::from_utf8_lossy(&merged).into_owned();

    ScriptResult {
        name: name.to_string(),
        outcome: if output.status.success() {
            ScriptOutcome::Success
        } else {
            ScriptOutcome::Fail
        },
        output: text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_name_regex() {
        assert!(VALID_NAME.is_match("00-verify"));
        assert!(VALID_NAME.is_match("my_hook"));
        assert!(!VALID_NAME.is_match("hook with spaces"));
        assert!(!VALID_NAME.is_match("../escape"));
    }

    #[tokio::test]
    async fn missing_hook_dir_yields_empty_results() {
        let env = HookEnv {
            op_code: "OpStartupInstance".into(),
            hook_path: "instance-start".into(),
            extra: BTreeMap::new(),
        };
        let results = run_phase(Path::new("/nonexistent/base"), &env, HookPhase::Pre)
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
