//! Builds a runtime `BlockDevice` tree from the wire-format `Disk`
//! descriptor an opcode carries, and the handful of operations whose
//! signature differs per variant (`create` needs PV/stripe info only LVs
//! use) and so aren't part of `BlockDevice`'s unified dispatch.

use crate::core::bdev::{Absent, BlockDevice, Drbd8, FileDisk, LogicalVolume, PvInfo};
use crate::core::cluster_config::{Disk, DiskKind};
use crate::core::errors::{GanetiError, Result};
use serde_json::Value;

/// Recursively turns a wire `Disk` into the matching `BlockDevice` variant,
/// descending into `children` for DRBD8's data/meta pair.
pub fn block_device_from_disk(disk: &Disk) -> Result<BlockDevice> {
    match &disk.dev_type {
        DiskKind::Lv { vg, lv_name } => Ok(BlockDevice::Lv(LogicalVolume::from_descriptor(vg, lv_name, disk.size))),
        DiskKind::File { path } => Ok(BlockDevice::File(FileDisk::from_descriptor(path, disk.size))),
        DiskKind::Absent => Ok(BlockDevice::Absent(Absent)),
        DiskKind::Drbd8 { logical_id } => {
            let data_disk = disk
                .data_child()
                .ok_or_else(|| GanetiError::InvalidRequest("drbd8 disk missing data child".into()))?;
            let meta_disk = disk
                .meta_child()
                .ok_or_else(|| GanetiError::InvalidRequest("drbd8 disk missing meta child".into()))?;
            let (data_vg, data_lv) = lv_fields(data_disk)?;
            let (meta_vg, meta_lv) = lv_fields(meta_disk)?;
            let data = LogicalVolume::from_descriptor(data_vg, data_lv, data_disk.size);
            let meta = LogicalVolume::from_descriptor(meta_vg, meta_lv, meta_disk.size);
            let drbd = Drbd8::from_descriptor(
                logical_id.local_minor,
                Some(logical_id.lhost.clone()),
                Some(logical_id.lport),
                Some(logical_id.rhost.clone()),
                Some(logical_id.rport),
                logical_id.secret.clone(),
                data,
                meta,
                disk.size,
            );
            Ok(BlockDevice::Drbd8(Box::new(drbd)))
        }
    }
}

fn lv_fields(disk: &Disk) -> Result<(&str, &str)> {
    match &disk.dev_type {
        DiskKind::Lv { vg, lv_name } => Ok((vg.as_str(), lv_name.as_str())),
        _ => Err(GanetiError::InvalidRequest("drbd8 children must be lv-backed".into())),
    }
}

/// Parses the `pvs` argument (`[{"name": ..., "free_mib": ...}, ...]`) a
/// `blockdev_create`/`blockdev_addchildren` call carries for LV placement.
pub fn pvs_arg(args: &Value) -> Vec<PvInfo> {
    args.get("pvs")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|v| {
                    let name = v.get("name")?.as_str()?.to_string();
                    let free_mib = v.get("free_mib")?.as_u64()?;
                    Some(PvInfo { name, free_mib })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Dispatches `create` by variant: LV needs PV placement, DRBD8 and file
/// disks create their own backing store (DRBD8's data/meta LVs use the
/// same `pvs` list), absent disks cannot be created.
pub async fn create(dev: &mut BlockDevice, pvs: &[PvInfo], stripes: usize) -> Result<()> {
    match dev {
        BlockDevice::Lv(lv) => lv.create(pvs, stripes).await,
        BlockDevice::Drbd8(d) => {
            d.data.create(pvs, stripes).await?;
            d.meta.create(pvs, 1).await?;
            d.assemble().await
        }
        BlockDevice::File(f) => f.create().await,
        BlockDevice::Absent(_) => Err(GanetiError::BlockDeviceError("cannot create an absent device".into())),
    }
}

/// Attaches to an already-existing device by identity, reporting whether
/// it was found (§9, "attach to existing by identity").
pub async fn attach(dev: &mut BlockDevice) -> Result<bool> {
    match dev {
        BlockDevice::Lv(lv) => lv.attach().await,
        BlockDevice::Drbd8(d) => d.attach().await,
        BlockDevice::File(f) => f.attach().await,
        BlockDevice::Absent(_) => Ok(false),
    }
}
