/// Result of `GetSyncStatus` (§4.2): percent/eta are `None` when the
/// device is not resyncing (fully in sync, or the concept doesn't apply).
/// `ldisk` is true when local backing storage is missing — an LV of
/// virtual type, or a DRBD device in `Diskless`/`Inconsistent` local disk
/// state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStatus {
    pub percent: Option<f64>,
    pub eta_seconds: Option<u64>,
    pub degraded: bool,
    pub ldisk: bool,
}

impl SyncStatus {
    pub fn in_sync() -> Self {
        Self {
            percent: None,
            eta_seconds: None,
            degraded: false,
            ldisk: false,
        }
    }

    /// Recursive min-percent / max-eta / any-degraded / any-ldisk fold over
    /// a disk tree (§4.2, "CombinedSyncStatus"), used by both ReplaceDisks
    /// step 5 and cluster-verify.
    pub fn combine(statuses: &[SyncStatus]) -> SyncStatus {
        let mut percent: Option<f64> = None;
        let mut eta: Option<u64> = None;
        let mut degraded = false;
        let mut ldisk = false;
        for s in statuses {
            percent = match (percent, s.percent) {
                (None, p) => p,
                (p, None) => p,
                (Some(a), Some(b)) => Some(a.min(b)),
            };
            eta = match (eta, s.eta_seconds) {
                (None, e) => e,
                (e, None) => e,
                (Some(a), Some(b)) => Some(a.max(b)),
            };
            degraded |= s.degraded;
            ldisk |= s.ldisk;
        }
        SyncStatus {
            percent,
            eta_seconds: eta,
            degraded,
            ldisk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_empty_is_in_sync() {
        let combined = SyncStatus::combine(&[]);
        assert_eq!(combined, SyncStatus::in_sync());
    }

    #[test]
    fn combine_takes_min_percent_max_eta_any_degraded() {
        let a = SyncStatus {
            percent: Some(80.0),
            eta_seconds: Some(10),
            degraded: false,
            ldisk: false,
        };
        let b = SyncStatus {
            percent: Some(40.0),
            eta_seconds: Some(30),
            degraded: true,
            ldisk: true,
        };
        let combined = SyncStatus::combine(&[a, b]);
        assert_eq!(combined.percent, Some(40.0));
        assert_eq!(combined.eta_seconds, Some(30));
        assert!(combined.degraded);
        assert!(combined.ldisk);
    }
}
