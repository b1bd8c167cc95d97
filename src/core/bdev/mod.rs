//! The block-device abstraction (§4.2): a recursive tree of four variants
//! (LV, DRBD8, file, absent), each implementing the same five-state
//! lifecycle (absent -> existing -> active-ro -> active-rw). Grounded on
//! the design note "recursive heterogeneous trees -> tagged variants": a
//! sum type operated on by functions that pattern-match the variant,
//! rather than a trait object / v-table.

mod absent;
mod cache;
mod drbd8;
mod file;
mod lv;
mod process;
mod proc_drbd;
mod sync_status;

pub use absent::Absent;
pub use cache::{BdevCache, CacheEntry, DiskRole};
pub use drbd8::{Drbd8, MAX_MINORS};
pub use file::FileDisk;
pub use lv::{LogicalVolume, PvInfo};
pub use proc_drbd::DrbdStatus;
pub use sync_status::SyncStatus;

/// Re-exported for `core::backend`'s storage-introspection procedures
/// (`vg_list`/`lv_list`/etc.), which shell out to the same LVM tools this
/// module does and want the same bounded-capture behavior.
pub(crate) use process::{ProcessOutput, run, run_checked};

use crate::core::errors::{GanetiError, Result};

/// The polymorphic device tree (§9). Each operation pattern-matches the
/// variant rather than dispatching through a trait object; recursion over
/// children (`combined_sync_status`) is explicit.
#[derive(Debug, Clone)]
pub enum BlockDevice {
    Lv(LogicalVolume),
    Drbd8(Box<Drbd8>),
    File(FileDisk),
    Absent(Absent),
}

impl BlockDevice {
    pub async fn assemble(&mut self) -> Result<()> {
        match self {
            BlockDevice::Lv(lv) => lv.assemble().await,
            BlockDevice::Drbd8(d) => d.assemble().await,
            BlockDevice::File(f) => f.assemble().await,
            BlockDevice::Absent(a) => a.assemble(),
        }
    }

    /// LV and file are no-ops; DRBD8 issues `drbdsetup primary`.
    pub async fn open(&mut self, force: bool) -> Result<()> {
        match self {
            BlockDevice::Lv(_) | BlockDevice::File(_) => Ok(()),
            BlockDevice::Drbd8(d) => d.open(force).await,
            BlockDevice::Absent(_) => Err(GanetiError::BlockDeviceError("cannot open an absent device".into())),
        }
    }

    /// LV and file are no-ops; DRBD8 issues `drbdsetup secondary`.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            BlockDevice::Lv(_) | BlockDevice::File(_) => Ok(()),
            BlockDevice::Drbd8(d) => d.close().await,
            BlockDevice::Absent(_) => Err(GanetiError::BlockDeviceError("cannot close an absent device".into())),
        }
    }

    /// LV and file are no-ops (Shutdown is the reverse of Assemble and
    /// there's no active-ro concept below the DRBD layer); DRBD8 issues
    /// `drbdsetup down`, freeing the minor. Children remain assembled.
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            BlockDevice::Lv(_) | BlockDevice::File(_) => Ok(()),
            BlockDevice::Drbd8(d) => d.shutdown().await,
            BlockDevice::Absent(_) => Ok(()),
        }
    }

    pub async fn remove(&mut self) -> Result<()> {
        match self {
            BlockDevice::Lv(lv) => lv.remove().await,
            BlockDevice::Drbd8(d) => d.remove().await,
            BlockDevice::File(f) => f.remove().await,
            BlockDevice::Absent(_) => Ok(()),
        }
    }

    /// LV only; cross-VG rename is refused by the LV layer itself. DRBD8
    /// rename is never supported — the minor is reassigned instead.
    pub async fn rename(&mut self, new_id: &str) -> Result<()> {
        match self {
            BlockDevice::Lv(lv) => lv.rename(new_id).await,
            BlockDevice::Drbd8(d) => d.rename(),
            BlockDevice::File(_) => Err(GanetiError::BlockDeviceError("cannot rename a file-backed disk".into())),
            BlockDevice::Absent(_) => Err(GanetiError::BlockDeviceError("cannot rename an absent device".into())),
        }
    }

    pub async fn grow(&mut self, amount_mib: u64) -> Result<()> {
        match self {
            BlockDevice::Lv(lv) => lv.grow(amount_mib).await,
            BlockDevice::Drbd8(d) => d.grow(amount_mib).await,
            BlockDevice::File(f) => f.grow(amount_mib).await,
            BlockDevice::Absent(_) => Err(GanetiError::BlockDeviceError("cannot grow an absent device".into())),
        }
    }

    /// `None` means the size could not be determined; `Some(0)` means a
    /// zero-sized device was positively identified. Preserved faithfully
    /// per §9 Open Question (i) rather than collapsed to one sentinel.
    pub fn get_size(&self) -> Option<u64> {
        match self {
            BlockDevice::Lv(lv) => lv.get_size(),
            BlockDevice::Drbd8(d) => {
                if d.minor.is_some() {
                    Some(d.size_mib)
                } else {
                    None
                }
            }
            BlockDevice::File(f) => f.get_size(),
            BlockDevice::Absent(a) => a.get_size(),
        }
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        match self {
            BlockDevice::Lv(lv) => Ok(lv.sync_status()),
            BlockDevice::Drbd8(d) => d.get_sync_status().await,
            BlockDevice::File(f) => Ok(f.sync_status()),
            BlockDevice::Absent(a) => Ok(a.sync_status()),
        }
    }

    /// Recursive min-percent / max-eta / any-degraded / any-ldisk fold
    /// over this node and (for DRBD8) its children (§4.2, "CombinedSyncStatus").
    pub async fn combined_sync_status(&self) -> Result<SyncStatus> {
        let mut statuses = vec![self.sync_status().await?];
        if let BlockDevice::Drbd8(d) = self {
            statuses.push(d.data.sync_status());
            statuses.push(d.meta.sync_status());
        }
        Ok(SyncStatus::combine(&statuses))
    }

    pub fn dev_path(&self) -> Option<&str> {
        match self {
            BlockDevice::Lv(lv) => lv.dev_path.as_deref(),
            BlockDevice::Drbd8(d) => d.dev_path.as_deref(),
            BlockDevice::File(f) => Some(f.path.as_str()),
            BlockDevice::Absent(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_size_none_vs_zero_distinguished() {
        let lv = LogicalVolume::from_descriptor("vg0", "d", 0);
        let mut dev = BlockDevice::Lv(lv);
        assert_eq!(dev.get_size(), None, "unattached LV reports None, not Some(0)");
        if let BlockDevice::Lv(ref mut lv) = dev {
            lv.attached = true;
        }
        assert_eq!(dev.get_size(), Some(0), "attached zero-sized LV reports Some(0)");
    }
}
