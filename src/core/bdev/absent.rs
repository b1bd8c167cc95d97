use super::sync_status::SyncStatus;
use crate::core::errors::{GanetiError, Result};

/// The "missing" variant of the disk tree: a descriptor whose backing
/// storage is known not to exist on this node. Every mutating operation
/// fails; queries report the absent state faithfully rather than erroring.
#[derive(Debug, Clone, Default)]
pub struct Absent;

impl Absent {
    pub fn assemble(&self) -> Result<()> {
        Err(GanetiError::BlockDeviceError(
            "cannot assemble an absent device".into(),
        ))
    }

    pub fn get_size(&self) -> Option<u64> {
        None
    }

    pub fn sync_status(&self) -> SyncStatus {
        SyncStatus {
            percent: None,
            eta_seconds: None,
            degraded: true,
            ldisk: true,
        }
    }
}
