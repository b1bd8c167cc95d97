use super::process::run_checked;
use super::sync_status::SyncStatus;
use crate::core::errors::{GanetiError, Result};
use tracing::{info, warn};

/// A physical volume's name and free space, used to choose a striping
/// layout (§4.2: "striping across physical volumes sorted by free space").
#[derive(Debug, Clone)]
pub struct PvInfo {
    pub name: String,
    pub free_mib: u64,
}

/// An LVM logical volume, one leaf of the disk tree.
#[derive(Debug, Clone)]
pub struct LogicalVolume {
    pub vg: String,
    pub lv_name: String,
    pub size_mib: u64,
    pub attached: bool,
    pub dev_path: Option<String>,
}

impl LogicalVolume {
    pub fn from_descriptor(vg: impl Into<String>, lv_name: impl Into<String>, size_mib: u64) -> Self {
        Self {
            vg: vg.into(),
            lv_name: lv_name.into(),
            size_mib,
            attached: false,
            dev_path: None,
        }
    }

    fn path(&self) -> String {
        format!("/dev/{}/{}", self.vg, self.lv_name)
    }

    /// Populates `dev_path` and `attached` by checking whether the LV
    /// already exists on this node (§9, "attach to existing by identity").
    pub async fn attach(&mut self) -> Result<bool> {
        let out = super::process::run("lvs", &["--noheadings", "-o", "lv_name", self.vg.as_str()]).await?;
        let found = out.stdout.lines().any(|l| l.trim() == self.lv_name);
        if found {
            self.dev_path = Some(self.path());
            self.attached = true;
        }
        Ok(found)
    }

    /// Creates the LV, trying `stripes` physical volumes sorted by free
    /// space, falling back to `stripes - 1` down to 1 on failure (§4.2,
    /// SUPPLEMENTED FEATURES).
    pub async fn create(&mut self, pvs: &[PvInfo], requested_stripes: usize) -> Result<()> {
        if self.attach().await? {
            return Ok(());
        }
        let mut sorted_pvs = pvs.to_vec();
        sorted_pvs.sort_by(|a, b| b.free_mib.cmp(&a.free_mib));
        let total_free: u64 = sorted_pvs.iter().map(|p| p.free_mib).sum();
        if total_free < self.size_mib {
            return Err(GanetiError::BlockDeviceError(format!(
                "VG '{}' has insufficient free space: need {} MiB, have {} MiB",
                self.vg, self.size_mib, total_free
            )));
        }

        let mut stripes = requested_stripes.max(1).min(sorted_pvs.len().max(1));
        loop {
            let pv_names: Vec<&str> = sorted_pvs.iter().take(stripes).map(|p| p.name.as_str()).collect();
            let size_arg = format!("{}m", self.size_mib);
            let mut args = vec!["-L", size_arg.as_str(), "-n", self.lv_name.as_str()];
            let stripes_str = stripes.to_string();
            if stripes > 1 {
                args.push("-i");
                args.push(stripes_str.as_str());
            }
            args.push(self.vg.as_str());
            args.extend(pv_names.iter());
            match run_checked("lvcreate", &args).await {
                Ok(_) => {
                    info!(lv = %self.lv_name, stripes, "created logical volume");
                    self.dev_path = Some(self.path());
                    self.attached = true;
                    return Ok(());
                }
                Err(e) if stripes > 1 => {
                    warn!(lv = %self.lv_name, stripes, error = %e, "lvcreate failed, retrying with fewer stripes");
                    stripes -= 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn assemble(&mut self) -> Result<()> {
        if !self.attached {
            self.attach().await?;
        }
        if !self.attached {
            return Err(GanetiError::BlockDeviceError(format!(
                "LV '{}/{}' does not exist",
                self.vg, self.lv_name
            )));
        }
        run_checked("lvchange", &["-ay", &self.path()]).await?;
        Ok(())
    }

    pub async fn remove(&mut self) -> Result<()> {
        if !self.attached && !self.attach().await? {
            return Ok(());
        }
        run_checked("lvremove", &["-f", &self.path()]).await?;
        self.attached = false;
        self.dev_path = None;
        Ok(())
    }

    /// Cross-VG rename is refused (§4.2).
    pub async fn rename(&mut self, new_id: &str) -> Result<()> {
        run_checked("lvrename", &[&self.vg, &self.lv_name, new_id]).await?;
        self.lv_name = new_id.to_string();
        self.dev_path = Some(self.path());
        Ok(())
    }

    /// Grows by `amount_mib`, trying allocation policies `contiguous ->
    /// cling -> normal` in order, stopping at the first success (§4.2).
    pub async fn grow(&mut self, amount_mib: u64) -> Result<()> {
        let size_arg = format!("+{amount_mib}m");
        for policy in ["contiguous", "cling", "normal"] {
            let result = run_checked(
                "lvextend",
                &["--alloc", policy, "-L", &size_arg, &self.path()],
            )
            .await;
            if result.is_ok() {
                self.size_mib += amount_mib;
                return Ok(());
            }
        }
        Err(GanetiError::BlockDeviceError(format!(
            "lvextend failed for '{}' under all allocation policies",
            self.lv_name
        )))
    }

    pub fn get_size(&self) -> Option<u64> {
        if self.attached { Some(self.size_mib) } else { None }
    }

    /// Creates a copy-on-write snapshot for export (§6, "one gzip-compressed
    /// image per disk"): the dump reads from the snapshot so the export
    /// doesn't race a running instance's writes. `snap_size_mib` need only
    /// cover the expected change volume during the dump, not the full disk.
    pub async fn snapshot(&self, snap_name: &str, snap_size_mib: u64) -> Result<String> {
        let size_arg = format!("{snap_size_mib}m");
        run_checked(
            "lvcreate",
            &["-L", &size_arg, "-s", "-n", snap_name, &self.path()],
        )
        .await?;
        Ok(format!("/dev/{}/{}", self.vg, snap_name))
    }

    pub fn sync_status(&self) -> SyncStatus {
        SyncStatus {
            percent: None,
            eta_seconds: None,
            degraded: false,
            ldisk: !self.attached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_is_vg_scoped() {
        let lv = LogicalVolume::from_descriptor("vg0", "uniq_data", 1024);
        assert_eq!(lv.path(), "/dev/vg0/uniq_data");
    }

    #[test]
    fn size_none_until_attached() {
        let lv = LogicalVolume::from_descriptor("vg0", "uniq_data", 1024);
        assert_eq!(lv.get_size(), None);
    }
}
