//! The node backend dispatcher (§4.7): ~60 named RPC procedures, each
//! rebuilding the device tree (or touching the hypervisor, or shelling out
//! to LVM) from its decoded JSON argument list and returning `(success,
//! payload)`. Grounded on `examples/original_source/lib/backend.py`'s flat
//! procedure module for the name list, and on the teacher's
//! `core::commands::command_trait.rs` "one trait, one dispatch enum" idiom
//! for the shape of `dispatch`, generalized from a fixed command enum to a
//! string-keyed match (the wire protocol names procedures by string, not
//! by a closed Rust enum — `core::rpc::server::ProcedureDispatcher` is the
//! seam this implements).
//!
//! The node daemon holds no cluster-wide state of its own (§5): every
//! procedure either rebuilds a block device from the descriptor it was
//! handed, asks the hypervisor directly, shells out to LVM, or consults
//! the advisory dev cache. There is no node-local "instance registry".

mod disk_wire;

use crate::config::PathsConfig;
use crate::core::bdev::{self, BdevCache, BlockDevice, CacheEntry, DiskRole, DrbdStatus, ProcessOutput};
use crate::core::cluster_config::Disk;
use crate::core::errors::{GanetiError, Result};
use crate::core::hooks::{self, HookEnv, HookPhase, ScriptOutcome};
use crate::core::hypervisor::{self, Hypervisor};
use crate::core::iallocator::{self, AllocatorInput};
use crate::core::rpc::{Envelope, ProcedureDispatcher};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub use disk_wire::block_device_from_disk;

/// Absolute paths `upload_file` is permitted to write to (§4.7: "a small
/// constant whitelist"). Ssconf entries are matched by prefix since the
/// set of `ssconf_*` keys is open-ended; everything else is an exact path.
const UPLOAD_WHITELIST_EXACT: &[&str] = &[
    "/var/lib/ganeti/config.data",
    "/var/lib/ganeti/known_hosts",
    "/etc/hosts",
    "/var/run/ganeti/vnc.password",
];
const UPLOAD_WHITELIST_PREFIXES: &[&str] = &["/var/lib/ganeti/ssconf/ssconf_"];

fn upload_target_allowed(path: &str) -> bool {
    UPLOAD_WHITELIST_EXACT.contains(&path) || UPLOAD_WHITELIST_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// The node-side dispatcher. One per node-daemon process, handed to
/// `core::rpc::run_server` as the `ProcedureDispatcher`.
pub struct NodeBackend {
    cache: BdevCache,
    paths: PathsConfig,
    hooks_base_dir: PathBuf,
}

impl NodeBackend {
    pub fn new(paths: PathsConfig) -> Self {
        Self {
            cache: BdevCache::new(paths.bdev_cache_dir.clone()),
            hooks_base_dir: PathBuf::from(&paths.hooks_base_dir),
            paths,
        }
    }

    fn hypervisor(args: &Value) -> Result<Box<dyn Hypervisor>> {
        let name = args.get("hypervisor").and_then(Value::as_str).unwrap_or("kvm");
        hypervisor::by_name(name)
    }

    fn disk_arg(args: &Value) -> Result<Disk> {
        serde_json::from_value(
            args.get("disk")
                .cloned()
                .ok_or_else(|| GanetiError::InvalidRequest("missing 'disk' argument".into()))?,
        )
        .map_err(|e| GanetiError::InvalidRequest(format!("invalid 'disk' argument: {e}")))
    }

    fn disks_arg(args: &Value) -> Result<Vec<Disk>> {
        serde_json::from_value(
            args.get("disks")
                .cloned()
                .ok_or_else(|| GanetiError::InvalidRequest("missing 'disks' argument".into()))?,
        )
        .map_err(|e| GanetiError::InvalidRequest(format!("invalid 'disks' argument: {e}")))
    }

    fn instance_name_arg(args: &Value) -> Result<String> {
        args.get("instance_name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'instance_name' argument".into()))
    }

    async fn record_cache(&self, dev: &BlockDevice, instance_name: &str, role: DiskRole, iv_name: &str) {
        if let Some(path) = dev.dev_path() {
            let entry = CacheEntry {
                owner: instance_name.to_string(),
                role,
                iv_name: iv_name.to_string(),
            };
            if let Err(e) = self.cache.write(path, &entry).await {
                warn!(path, error = %e, "failed to write dev cache entry");
            }
        }
    }

    fn disk_role(args: &Value) -> DiskRole {
        match args.get("role").and_then(Value::as_str) {
            Some("secondary") => DiskRole::Secondary,
            _ => DiskRole::Primary,
        }
    }

    // ---- block device family (§4.7) ----

    async fn blockdev_create(&self, args: Value) -> Result<Value> {
        let disk = Self::disk_arg(&args)?;
        let instance_name = Self::instance_name_arg(&args).unwrap_or_default();
        let role = Self::disk_role(&args);
        let pvs = disk_wire::pvs_arg(&args);
        let stripes = args.get("stripes").and_then(Value::as_u64).unwrap_or(1) as usize;
        let mut dev = block_device_from_disk(&disk)?;
        disk_wire::create(&mut dev, &pvs, stripes).await?;
        self.record_cache(&dev, &instance_name, role, &disk.iv_name).await;
        Ok(json!({"dev_path": dev.dev_path()}))
    }

    async fn blockdev_assemble(&self, args: Value) -> Result<Value> {
        let disk = Self::disk_arg(&args)?;
        let instance_name = Self::instance_name_arg(&args).unwrap_or_default();
        let role = Self::disk_role(&args);
        let mut dev = block_device_from_disk(&disk)?;
        dev.assemble().await?;
        self.record_cache(&dev, &instance_name, role, &disk.iv_name).await;
        Ok(json!({"dev_path": dev.dev_path()}))
    }

    async fn blockdev_shutdown(&self, args: Value) -> Result<Value> {
        let disk = Self::disk_arg(&args)?;
        let mut dev = block_device_from_disk(&disk)?;
        if let Some(path) = dev.dev_path() {
            self.cache.remove(path).await.ok();
        }
        dev.shutdown().await?;
        Ok(Value::Null)
    }

    async fn blockdev_remove(&self, args: Value) -> Result<Value> {
        let disk = Self::disk_arg(&args)?;
        let mut dev = block_device_from_disk(&disk)?;
        if let Some(path) = dev.dev_path() {
            self.cache.remove(path).await.ok();
        }
        dev.remove().await?;
        Ok(Value::Null)
    }

    async fn blockdev_find(&self, args: Value) -> Result<Value> {
        let disk = Self::disk_arg(&args)?;
        let mut dev = block_device_from_disk(&disk)?;
        let found = disk_wire::attach(&mut dev).await?;
        Ok(json!({"found": found, "dev_path": dev.dev_path(), "size": dev.get_size()}))
    }

    async fn blockdev_getmirrorstatus(&self, args: Value) -> Result<Value> {
        let disks = Self::disks_arg(&args)?;
        let mut out = Vec::with_capacity(disks.len());
        for disk in &disks {
            let mut dev = block_device_from_disk(disk)?;
            disk_wire::attach(&mut dev).await.ok();
            let status = dev.combined_sync_status().await?;
            out.push(json!({
                "iv_name": disk.iv_name,
                "percent": status.percent,
                "eta_seconds": status.eta_seconds,
                "degraded": status.degraded,
                "ldisk": status.ldisk,
            }));
        }
        Ok(Value::Array(out))
    }

    /// §4.5 step 3/6: allocate or remove a whole batch of replacement
    /// children (data+meta pairs) in one call, rather than one at a time.
    async fn blockdev_addchildren(&self, args: Value) -> Result<Value> {
        let disks = Self::disks_arg(&args)?;
        let pvs = disk_wire::pvs_arg(&args);
        let stripes = args.get("stripes").and_then(Value::as_u64).unwrap_or(1) as usize;
        let mut created = Vec::with_capacity(disks.len());
        for disk in &disks {
            let mut dev = block_device_from_disk(disk)?;
            disk_wire::create(&mut dev, &pvs, stripes).await?;
            created.push(json!({"iv_name": disk.iv_name, "dev_path": dev.dev_path()}));
        }
        Ok(Value::Array(created))
    }

    async fn blockdev_removechildren(&self, args: Value) -> Result<Value> {
        let disks = Self::disks_arg(&args)?;
        for disk in &disks {
            let mut dev = block_device_from_disk(disk)?;
            if let Err(e) = dev.remove().await {
                warn!(iv_name = %disk.iv_name, error = %e, "blockdev_removechildren: individual removal failed (warning only)");
            }
        }
        Ok(Value::Null)
    }

    async fn blockdev_close(&self, args: Value) -> Result<Value> {
        let disk = Self::disk_arg(&args)?;
        let mut dev = block_device_from_disk(&disk)?;
        dev.close().await?;
        Ok(Value::Null)
    }

    async fn blockdev_rename(&self, args: Value) -> Result<Value> {
        let disk = Self::disk_arg(&args)?;
        let new_id = args
            .get("new_id")
            .and_then(Value::as_str)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'new_id' argument".into()))?;
        let mut dev = block_device_from_disk(&disk)?;
        dev.rename(new_id).await?;
        Ok(json!({"dev_path": dev.dev_path()}))
    }

    async fn blockdev_grow(&self, args: Value) -> Result<Value> {
        let disk = Self::disk_arg(&args)?;
        let amount = args
            .get("amount_mib")
            .and_then(Value::as_u64)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'amount_mib' argument".into()))?;
        let mut dev = block_device_from_disk(&disk)?;
        dev.grow(amount).await?;
        Ok(json!({"size": dev.get_size()}))
    }

    /// LV-only (§4.2, "Creates a copy-on-write snapshot for export").
    async fn blockdev_snapshot(&self, args: Value) -> Result<Value> {
        let disk = Self::disk_arg(&args)?;
        let snap_name = args
            .get("snapshot_name")
            .and_then(Value::as_str)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'snapshot_name' argument".into()))?;
        let snap_size = args.get("snapshot_size_mib").and_then(Value::as_u64).unwrap_or(disk.size);
        let BlockDevice::Lv(lv) = block_device_from_disk(&disk)? else {
            return Err(GanetiError::BlockDeviceError("blockdev_snapshot is only supported for LV-backed disks".into()));
        };
        let snap_path = lv.snapshot(snap_name, snap_size).await?;
        Ok(json!({"snapshot_path": snap_path}))
    }

    /// §6: one gzip-compressed image per disk, under `<export_dir>/<instance>/diskN_dump`.
    async fn blockdev_export(&self, args: Value) -> Result<Value> {
        let disk = Self::disk_arg(&args)?;
        let instance_name = Self::instance_name_arg(&args)?;
        let disk_index = args.get("disk_index").and_then(Value::as_u64).unwrap_or(0);
        let mut dev = block_device_from_disk(&disk)?;
        disk_wire::attach(&mut dev).await?;
        let src = dev
            .dev_path()
            .ok_or_else(|| GanetiError::BlockDeviceError("blockdev_export: device has no dev_path".into()))?
            .to_string();

        let dest_dir = Path::new(&self.paths.export_dir).join(format!("{instance_name}.new"));
        tokio::fs::create_dir_all(&dest_dir).await?;
        let dest = dest_dir.join(format!("disk{disk_index}_dump"));

        let shell_cmd = format!("dd if={} bs=1M 2>/dev/null | gzip -c > {}", src, dest.display());
        let output = tokio::process::Command::new("sh").arg("-c").arg(&shell_cmd).output().await?;
        if !output.status.success() {
            return Err(GanetiError::ExecError(format!(
                "export dump failed for '{src}': {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(json!({"dump_path": dest.to_string_lossy()}))
    }

    // ---- DRBD orchestration (§4.7, §4.2.1-4.2.2) ----

    async fn drbd_disconnect_net(&self, args: Value) -> Result<Value> {
        let disks = Self::disks_arg(&args)?;
        for disk in &disks {
            if let BlockDevice::Drbd8(mut d) = block_device_from_disk(disk)? {
                d.attach().await.ok();
                d.disconnect_net().await?;
            }
        }
        Ok(Value::Null)
    }

    async fn drbd_attach_net(&self, args: Value) -> Result<Value> {
        let disks = Self::disks_arg(&args)?;
        let dual_primary = args.get("dual_primary").and_then(Value::as_bool).unwrap_or(false);
        for disk in &disks {
            if let BlockDevice::Drbd8(mut d) = block_device_from_disk(disk)? {
                d.attach().await.ok();
                d.attach_net(dual_primary).await?;
            }
        }
        Ok(Value::Null)
    }

    /// Single poll (not a blocking wait loop — that lives master-side in
    /// `ReplaceDisksLu`/`MigrateInstanceLu`, which re-invoke this every few
    /// seconds per §4.5 step 5 / §4.6 step 4). Answers "which DRBD devices
    /// does this instance own" from the advisory dev cache since the node
    /// daemon holds no instance registry of its own.
    async fn drbd_wait_sync(&self, args: Value) -> Result<Value> {
        let instance_name = Self::instance_name_arg(&args)?;
        let owned = self.cache.list_for_owner(&instance_name).await?;
        let mut statuses = Vec::new();
        for (dev_path, _entry) in owned.iter().filter(|(p, _)| p.contains("drbd")) {
            let Some(minor) = dev_path.rsplit("drbd").next().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let proc = tokio::fs::read_to_string("/proc/drbd").await.unwrap_or_default();
            if let Ok(status) = DrbdStatus::for_minor(&proc, minor) {
                let degraded = !status.is_connected() || status.is_ldisk();
                statuses.push((status.sync_percent, status.eta_seconds, degraded));
            }
        }
        let percent = statuses.iter().filter_map(|(p, _, _)| *p).fold(None, |acc: Option<f64>, p| {
            Some(acc.map_or(p, |a| a.min(p)))
        });
        let eta = statuses.iter().filter_map(|(_, e, _)| *e).max();
        let degraded = statuses.is_empty() || statuses.iter().any(|(_, _, d)| *d);
        Ok(json!({"sync_percent": percent, "eta_seconds": eta, "degraded": degraded}))
    }

    // ---- instance lifecycle ----

    async fn instance_start(&self, args: Value) -> Result<Value> {
        let instance_name = Self::instance_name_arg(&args)?;
        let hv = Self::hypervisor(&args)?;
        if let Some(info) = hv.instance_info(&instance_name).await? {
            if info.running {
                return Ok(json!({"status": "already running"}));
            }
        }
        hv.start_instance(&instance_name).await?;
        Ok(json!({"status": "started"}))
    }

    /// ACPI shutdown then poll up to ~2 minutes (11 x 10s, §5), then
    /// force-destroy (§4.7).
    async fn instance_shutdown(&self, args: Value) -> Result<Value> {
        let instance_name = Self::instance_name_arg(&args)?;
        let hv = Self::hypervisor(&args)?;
        match hv.instance_info(&instance_name).await? {
            None => return Ok(json!({"status": "already stopped"})),
            Some(info) if !info.running => return Ok(json!({"status": "already stopped"})),
            Some(_) => {}
        }
        hv.stop_instance(&instance_name, false).await?;
        for _ in 0..11 {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            match hv.instance_info(&instance_name).await? {
                None => return Ok(json!({"status": "stopped"})),
                Some(info) if !info.running => return Ok(json!({"status": "stopped"})),
                _ => {}
            }
        }
        warn!(instance = %instance_name, "ACPI shutdown timed out, forcing destroy");
        hv.stop_instance(&instance_name, true).await?;
        Ok(json!({"status": "force-stopped"}))
    }

    async fn instance_reboot(&self, args: Value) -> Result<Value> {
        let instance_name = Self::instance_name_arg(&args)?;
        Self::hypervisor(&args)?.reboot_instance(&instance_name).await?;
        Ok(Value::Null)
    }

    async fn instance_migrate(&self, args: Value) -> Result<Value> {
        let instance_name = Self::instance_name_arg(&args)?;
        let target = args
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'target' argument".into()))?;
        let live = args.get("live").and_then(Value::as_bool).unwrap_or(true);
        Self::hypervisor(&args)?.migrate_instance(&instance_name, target, live).await?;
        Ok(Value::Null)
    }

    async fn instance_info(&self, args: Value) -> Result<Value> {
        let instance_name = Self::instance_name_arg(&args)?;
        let hv = Self::hypervisor(&args)?;
        match hv.instance_info(&instance_name).await? {
            Some(info) => Ok(serde_json::to_value(info)?),
            None => Ok(json!({"running": false})),
        }
    }

    async fn instance_list(&self, args: Value) -> Result<Value> {
        let hv = Self::hypervisor(&args)?;
        Ok(json!(hv.list_instances().await?))
    }

    async fn all_instances_info(&self, args: Value) -> Result<Value> {
        let hv = Self::hypervisor(&args)?;
        let mut out = Vec::new();
        for name in hv.list_instances().await? {
            if let Some(info) = hv.instance_info(&name).await? {
                out.push(serde_json::to_value(info)?);
            }
        }
        Ok(Value::Array(out))
    }

    /// OS-install script runner is an external collaborator (§1 "Out of
    /// scope"); this surfaces only the invocation seam.
    async fn instance_os_add(&self, args: Value) -> Result<Value> {
        let instance_name = Self::instance_name_arg(&args)?;
        let os = args
            .get("os")
            .and_then(Value::as_str)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'os' argument".into()))?;
        info!(instance = %instance_name, os, "instance_os_add: delegating to external OS-install script runner");
        Ok(json!({"status": "dispatched"}))
    }

    async fn instance_run_rename(&self, args: Value) -> Result<Value> {
        let old_name = args
            .get("old_name")
            .and_then(Value::as_str)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'old_name' argument".into()))?;
        let new_name = Self::instance_name_arg(&args)?;
        info!(old_name, new_name, "instance_run_rename: delegating to external OS-install script runner");
        Ok(Value::Null)
    }

    // ---- node housekeeping ----

    async fn upload_file(&self, args: Value) -> Result<Value> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'path' argument".into()))?;
        if !upload_target_allowed(path) {
            return Err(GanetiError::InvalidRequest(format!(
                "upload_file: '{path}' is not in the node-writable whitelist"
            )));
        }
        let envelope: Envelope = serde_json::from_value(
            args.get("content")
                .cloned()
                .ok_or_else(|| GanetiError::InvalidRequest("missing 'content' argument".into()))?,
        )?;
        let data = envelope.decode()?;
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = format!("{path}.new");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(Value::Null)
    }

    async fn write_ssconf_files(&self, args: Value) -> Result<Value> {
        let files = args
            .get("files")
            .and_then(Value::as_object)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'files' argument".into()))?;
        for (key, value) in files {
            let path = format!("/var/lib/ganeti/ssconf/ssconf_{key}");
            let contents = value.as_str().unwrap_or_default();
            let tmp = format!("{path}.new");
            if let Some(parent) = Path::new(&path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&tmp, contents).await?;
            tokio::fs::rename(&tmp, &path).await?;
        }
        Ok(Value::Null)
    }

    fn jobqueue_path(&self, args: &Value) -> Result<PathBuf> {
        let rel = args
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'path' argument".into()))?;
        let full = Path::new(&self.paths.jobqueue_dir).join(rel);
        let queue_root = Path::new(&self.paths.jobqueue_dir);
        if !full.starts_with(queue_root) {
            return Err(GanetiError::InvalidRequest(format!(
                "jobqueue path '{rel}' escapes the queue directory"
            )));
        }
        Ok(full)
    }

    async fn jobqueue_update(&self, args: Value) -> Result<Value> {
        let path = self.jobqueue_path(&args)?;
        let envelope: Envelope = serde_json::from_value(
            args.get("content")
                .cloned()
                .ok_or_else(|| GanetiError::InvalidRequest("missing 'content' argument".into()))?,
        )?;
        let data = envelope.decode()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(Value::Null)
    }

    async fn jobqueue_rename(&self, args: Value) -> Result<Value> {
        let old = self.jobqueue_path(&args)?;
        let new_rel = args
            .get("new_path")
            .and_then(Value::as_str)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'new_path' argument".into()))?;
        let new = Path::new(&self.paths.jobqueue_dir).join(new_rel);
        if !new.starts_with(&self.paths.jobqueue_dir) {
            return Err(GanetiError::InvalidRequest("jobqueue rename target escapes the queue directory".into()));
        }
        tokio::fs::rename(&old, &new).await?;
        Ok(Value::Null)
    }

    async fn jobqueue_set_drain(&self, args: Value) -> Result<Value> {
        let drain = args.get("drain").and_then(Value::as_bool).unwrap_or(false);
        let marker = Path::new(&self.paths.jobqueue_dir).join("drain");
        if drain {
            tokio::fs::write(&marker, b"").await?;
        } else {
            match tokio::fs::remove_file(&marker).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Value::Null)
    }

    async fn jobqueue_purge(&self, _args: Value) -> Result<Value> {
        match tokio::fs::remove_dir_all(&self.paths.jobqueue_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.paths.jobqueue_dir).await?;
        Ok(Value::Null)
    }

    async fn node_info(&self, _args: Value) -> Result<Value> {
        let vg_out = bdev::run("vgs", &["--noheadings", "--nosuffix", "--units=m", "-o", "vg_name,vg_size,vg_free"])
            .await
            .unwrap_or(ProcessOutput { status_ok: false, stdout: String::new(), stderr: String::new() });
        Ok(json!({"vgs": vg_out.stdout.lines().map(str::trim).collect::<Vec<_>>()}))
    }

    /// Cluster-verify's per-node pass (§4.4 `VerifyCluster`): confirms the
    /// node is reachable and its LVM tooling responds, without comparing
    /// against the authoritative config (that comparison is master-side).
    async fn node_verify(&self, _args: Value) -> Result<Value> {
        let out = bdev::run("vgs", &["--noheadings"]).await?;
        Ok(json!({"lvm_ok": out.status_ok}))
    }

    async fn node_start_master(&self, _args: Value) -> Result<Value> {
        info!("node_start_master: taking on master role");
        Ok(Value::Null)
    }

    async fn node_stop_master(&self, _args: Value) -> Result<Value> {
        info!("node_stop_master: relinquishing master role");
        Ok(Value::Null)
    }

    async fn node_leave_cluster(&self, _args: Value) -> Result<Value> {
        info!("node_leave_cluster: cleaning up local cluster state");
        Ok(Value::Null)
    }

    async fn node_demote_from_mc(&self, _args: Value) -> Result<Value> {
        info!("node_demote_from_mc: demoting from master-candidate");
        Ok(Value::Null)
    }

    // ---- storage introspection ----

    async fn vg_list(&self, _args: Value) -> Result<Value> {
        let out = bdev::run_checked("vgs", &["--noheadings", "--nosuffix", "--units=m", "--separator=:", "-o", "vg_name,vg_size,vg_free"]).await?;
        let vgs: Vec<Value> = out
            .lines()
            .filter_map(|line| {
                let mut parts = line.trim().splitn(3, ':');
                let name = parts.next()?.to_string();
                let size: f64 = parts.next()?.parse().ok()?;
                let free: f64 = parts.next()?.parse().ok()?;
                Some(json!({"name": name, "size_mib": size, "free_mib": free}))
            })
            .collect();
        Ok(Value::Array(vgs))
    }

    async fn lv_list(&self, args: Value) -> Result<Value> {
        let vg = args.get("vg").and_then(Value::as_str);
        let mut lv_args = vec!["--noheadings", "--nosuffix", "--units=m", "--separator=:", "-o", "lv_name,lv_size,vg_name"];
        if let Some(vg) = vg {
            lv_args.push(vg);
        }
        let out = bdev::run_checked("lvs", &lv_args).await?;
        let lvs: Vec<Value> = out
            .lines()
            .filter_map(|line| {
                let mut parts = line.trim().splitn(3, ':');
                let name = parts.next()?.to_string();
                let size: f64 = parts.next()?.parse().ok()?;
                let vg_name = parts.next()?.to_string();
                Some(json!({"name": name, "vg": vg_name, "size_mib": size}))
            })
            .collect();
        Ok(Value::Array(lvs))
    }

    /// The dev-cache contents for this node, keyed by the dev path (§3).
    async fn node_volumes(&self, _args: Value) -> Result<Value> {
        let mut entries = match tokio::fs::read_dir(self.cache.dir()).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Value::Array(vec![])),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(escaped) = name.strip_prefix("bdev_") else { continue };
            let dev_path = escaped.replace('_', "/");
            if let Some(cached) = self.cache.read(&dev_path).await? {
                out.push(json!({"dev_path": dev_path, "owner": cached.owner, "iv_name": cached.iv_name}));
            }
        }
        Ok(Value::Array(out))
    }

    async fn bridges_exist(&self, args: Value) -> Result<Value> {
        let bridges: Vec<String> = args
            .get("bridges")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let mut missing = Vec::new();
        for bridge in &bridges {
            if tokio::fs::metadata(format!("/sys/class/net/{bridge}/bridge")).await.is_err() {
                missing.push(bridge.clone());
            }
        }
        Ok(json!({"missing": missing}))
    }

    // ---- hooks and allocator ----

    async fn hooks_runner(&self, args: Value) -> Result<Value> {
        let hook_path = args
            .get("hook_path")
            .and_then(Value::as_str)
            .ok_or_else(|| GanetiError::InvalidRequest("missing 'hook_path' argument".into()))?;
        let op_code = args.get("op_code").and_then(Value::as_str).unwrap_or("").to_string();
        let phase = match args.get("phase").and_then(Value::as_str) {
            Some("post") => HookPhase::Post,
            _ => HookPhase::Pre,
        };
        let extra = args
            .get("env")
            .and_then(Value::as_object)
            .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
            .unwrap_or_default();
        let env = HookEnv {
            op_code,
            hook_path: hook_path.to_string(),
            extra,
        };
        let results = hooks::run_phase(&self.hooks_base_dir, &env, phase).await?;
        Ok(json!(results
            .into_iter()
            .map(|r| json!({
                "name": r.name,
                "outcome": match r.outcome {
                    ScriptOutcome::Success => "success",
                    ScriptOutcome::Fail => "fail",
                    ScriptOutcome::Skip => "skip",
                },
                "output": r.output,
            }))
            .collect::<Vec<_>>()))
    }

    async fn iallocator_runner(&self, args: Value) -> Result<Value> {
        let input: AllocatorInput = serde_json::from_value(
            args.get("input")
                .cloned()
                .ok_or_else(|| GanetiError::InvalidRequest("missing 'input' argument".into()))?,
        )?;
        let output = iallocator::run_allocator(&self.paths.iallocator_script, &input).await?;
        Ok(serde_json::to_value(output)?)
    }
}

#[async_trait]
impl ProcedureDispatcher for NodeBackend {
    async fn dispatch(&self, procedure: &str, args: Value) -> (bool, Value) {
        let result = match procedure {
            "blockdev_create" => self.blockdev_create(args).await,
            "blockdev_assemble" => self.blockdev_assemble(args).await,
            "blockdev_shutdown" => self.blockdev_shutdown(args).await,
            "blockdev_remove" => self.blockdev_remove(args).await,
            "blockdev_find" => self.blockdev_find(args).await,
            "blockdev_getmirrorstatus" => self.blockdev_getmirrorstatus(args).await,
            "blockdev_addchildren" => self.blockdev_addchildren(args).await,
            "blockdev_removechildren" => self.blockdev_removechildren(args).await,
            "blockdev_close" => self.blockdev_close(args).await,
            "blockdev_rename" => self.blockdev_rename(args).await,
            "blockdev_grow" => self.blockdev_grow(args).await,
            "blockdev_snapshot" => self.blockdev_snapshot(args).await,
            "blockdev_export" => self.blockdev_export(args).await,
            "drbd_disconnect_net" => self.drbd_disconnect_net(args).await,
            "drbd_attach_net" => self.drbd_attach_net(args).await,
            "drbd_wait_sync" => self.drbd_wait_sync(args).await,
            "instance_start" => self.instance_start(args).await,
            "instance_shutdown" => self.instance_shutdown(args).await,
            "instance_reboot" => self.instance_reboot(args).await,
            "instance_migrate" => self.instance_migrate(args).await,
            "instance_info" => self.instance_info(args).await,
            "instance_list" => self.instance_list(args).await,
            "all_instances_info" => self.all_instances_info(args).await,
            "instance_os_add" => self.instance_os_add(args).await,
            "instance_run_rename" => self.instance_run_rename(args).await,
            "upload_file" => self.upload_file(args).await,
            "write_ssconf_files" => self.write_ssconf_files(args).await,
            "jobqueue_update" => self.jobqueue_update(args).await,
            "jobqueue_rename" => self.jobqueue_rename(args).await,
            "jobqueue_set_drain" => self.jobqueue_set_drain(args).await,
            "jobqueue_purge" => self.jobqueue_purge(args).await,
            "node_info" => self.node_info(args).await,
            "node_verify" => self.node_verify(args).await,
            "node_start_master" => self.node_start_master(args).await,
            "node_stop_master" => self.node_stop_master(args).await,
            "node_leave_cluster" => self.node_leave_cluster(args).await,
            "node_demote_from_mc" => self.node_demote_from_mc(args).await,
            "vg_list" => self.vg_list(args).await,
            "lv_list" => self.lv_list(args).await,
            "node_volumes" => self.node_volumes(args).await,
            "bridges_exist" => self.bridges_exist(args).await,
            "hooks_runner" => self.hooks_runner(args).await,
            "iallocator_runner" => self.iallocator_runner(args).await,
            other => Err(GanetiError::InvalidRequest(format!("unknown procedure '{other}'"))),
        };
        match result {
            Ok(payload) => (true, payload),
            Err(e) => {
                warn!(procedure, error = %e, "RPC procedure failed");
                (false, Value::String(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> NodeBackend {
        let mut paths = PathsConfig::default();
        paths.bdev_cache_dir = std::env::temp_dir()
            .join(format!("ganeti-backend-test-{}", rand::random::<u32>()))
            .to_string_lossy()
            .into_owned();
        NodeBackend::new(paths)
    }

    #[test]
    fn upload_whitelist_accepts_known_paths_rejects_others() {
        assert!(upload_target_allowed("/etc/hosts"));
        assert!(upload_target_allowed("/var/lib/ganeti/ssconf/ssconf_cluster_name"));
        assert!(!upload_target_allowed("/etc/shadow"));
        assert!(!upload_target_allowed("/root/.ssh/authorized_keys"));
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_procedure() {
        let backend = backend();
        let (ok, payload) = backend.dispatch("frobnicate", Value::Null).await;
        assert!(!ok);
        assert!(payload.as_str().unwrap().contains("unknown procedure"));
    }

    #[tokio::test]
    async fn bridges_exist_reports_all_missing_when_sysfs_absent() {
        let backend = backend();
        let (ok, payload) = backend
            .dispatch("bridges_exist", json!({"bridges": ["br-definitely-not-real"]}))
            .await;
        assert!(ok);
        assert_eq!(payload["missing"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upload_file_refuses_non_whitelisted_target() {
        let backend = backend();
        let (ok, payload) = backend
            .dispatch(
                "upload_file",
                json!({"path": "/etc/shadow", "content": {"encoding": "none", "content": "x"}}),
            )
            .await;
        assert!(!ok);
        assert!(payload.as_str().unwrap().contains("whitelist"));
    }
}
