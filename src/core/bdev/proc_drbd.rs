//! Parses `/proc/drbd` minor status lines (§3, "DRBD minor state").
//!
//! Grounded on `examples/original_source/lib/bdev.py`'s `DRBD8Status`
//! class: a regex-based line parser plus a set of derived booleans.

use crate::core::errors::{GanetiError, Result};
use regex::Regex;
use std::sync::LazyLock;

/// Connection state (`cs:` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Unconfigured,
    StandAlone,
    WfConnection,
    WfReportParams,
    Connected,
    StartingSyncS,
    StartingSyncT,
    WfBitMapS,
    WfBitMapT,
    WfSyncUuid,
    SyncSource,
    SyncTarget,
    PausedSyncS,
    PausedSyncT,
    Other(String),
}

impl ConnState {
    fn parse(s: &str) -> Self {
        match s {
            "Unconfigured" => Self::Unconfigured,
            "StandAlone" => Self::StandAlone,
            "WFConnection" => Self::WfConnection,
            "WFReportParams" => Self::WfReportParams,
            "Connected" => Self::Connected,
            "StartingSyncS" => Self::StartingSyncS,
            "StartingSyncT" => Self::StartingSyncT,
            "WFBitMapS" => Self::WfBitMapS,
            "WFBitMapT" => Self::WfBitMapT,
            "WFSyncUUID" => Self::WfSyncUuid,
            "SyncSource" => Self::SyncSource,
            "SyncTarget" => Self::SyncTarget,
            "PausedSyncS" => Self::PausedSyncS,
            "PausedSyncT" => Self::PausedSyncT,
            other => Self::Other(other.to_string()),
        }
    }

    fn is_in_resync(&self) -> bool {
        matches!(
            self,
            Self::WfReportParams
                | Self::StartingSyncS
                | Self::StartingSyncT
                | Self::WfBitMapS
                | Self::WfBitMapT
                | Self::WfSyncUuid
                | Self::SyncSource
                | Self::SyncTarget
                | Self::PausedSyncS
                | Self::PausedSyncT
        )
    }
}

/// Local/remote role (`ro:`) or disk state (`ds:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
    Unknown,
}

impl Role {
    fn parse(s: &str) -> Self {
        match s {
            "Primary" => Self::Primary,
            "Secondary" => Self::Secondary,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskState {
    Diskless,
    Attaching,
    Failed,
    Negotiating,
    Inconsistent,
    Outdated,
    DUnknown,
    Consistent,
    UpToDate,
    Other(String),
}

impl DiskState {
    fn parse(s: &str) -> Self {
        match s {
            "Diskless" => Self::Diskless,
            "Attaching" => Self::Attaching,
            "Failed" => Self::Failed,
            "Negotiating" => Self::Negotiating,
            "Inconsistent" => Self::Inconsistent,
            "Outdated" => Self::Outdated,
            "DUnknown" => Self::DUnknown,
            "Consistent" => Self::Consistent,
            "UpToDate" => Self::UpToDate,
            other => Self::Other(other.to_string()),
        }
    }
}

static UNCONF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*[0-9]+:\s*cs:Unconfigured$").unwrap());
static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*[0-9]+:\s*cs:(\S+)\s+(?:st|ro):([^/]+)/(\S+)\s+ds:([^/]+)/(\S+)\s+.*$",
    )
    .unwrap()
});
static SYNC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sync'ed:\s*([0-9.]+)%.*finish:\s*([0-9]+):([0-9]+):([0-9]+)").unwrap()
});

/// A single minor's parsed state (§3). Unconfigured minors carry `None`
/// roles/disk states, matching the original's "doesn't support unconfigured
/// devices" caveat loosened to a representable variant rather than a panic.
#[derive(Debug, Clone)]
pub struct DrbdStatus {
    pub cstate: ConnState,
    pub local_role: Option<Role>,
    pub remote_role: Option<Role>,
    pub local_disk: Option<DiskState>,
    pub remote_disk: Option<DiskState>,
    pub sync_percent: Option<f64>,
    pub eta_seconds: Option<u64>,
}

impl DrbdStatus {
    pub fn is_standalone(&self) -> bool {
        matches!(self.cstate, ConnState::StandAlone)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.cstate, ConnState::Connected)
    }

    pub fn is_in_resync(&self) -> bool {
        self.cstate.is_in_resync()
    }

    pub fn is_disk_uptodate(&self) -> bool {
        matches!(self.local_disk, Some(DiskState::UpToDate))
    }

    /// `ldisk` (§4.2): true when local backing storage is missing, i.e.
    /// diskless or inconsistent.
    pub fn is_ldisk(&self) -> bool {
        matches!(
            self.local_disk,
            None | Some(DiskState::Diskless) | Some(DiskState::Inconsistent)
        )
    }

    /// Parses one line of `/proc/drbd` (the `N: cs:... ` line for a minor).
    pub fn parse_line(line: &str) -> Result<Self> {
        if UNCONF_RE.is_match(line) {
            return Ok(Self {
                cstate: ConnState::Unconfigured,
                local_role: None,
                remote_role: None,
                local_disk: None,
                remote_disk: None,
                sync_percent: None,
                eta_seconds: None,
            });
        }
        let caps = LINE_RE
            .captures(line)
            .ok_or_else(|| GanetiError::BlockDeviceError(format!("can't parse /proc/drbd line '{line}'")))?;
        let cstate = ConnState::parse(&caps[1]);
        let is_resync = cstate.is_in_resync();
        let (sync_percent, eta_seconds) = match SYNC_RE.captures(line) {
            Some(sc) => {
                let pct: f64 = sc[1].parse().unwrap_or(0.0);
                let h: u64 = sc[2].parse().unwrap_or(0);
                let m: u64 = sc[3].parse().unwrap_or(0);
                let s: u64 = sc[4].parse().unwrap_or(0);
                (Some(pct), Some(h * 3600 + m * 60 + s))
            }
            None if is_resync => (Some(0.0), None),
            None => (None, None),
        };
        Ok(Self {
            cstate,
            local_role: Some(Role::parse(&caps[2])),
            remote_role: Some(Role::parse(&caps[3])),
            local_disk: Some(DiskState::parse(&caps[4])),
            remote_disk: Some(DiskState::parse(&caps[5])),
            sync_percent,
            eta_seconds,
        })
    }

    /// Finds and parses the line for `minor` within a full `/proc/drbd` dump.
    pub fn for_minor(proc_drbd: &str, minor: u32) -> Result<Self> {
        let prefix = format!("{minor}:");
        for line in proc_drbd.lines() {
            if line.trim_start().starts_with(&prefix) {
                return Self::parse_line(line);
            }
        }
        Err(GanetiError::BlockDeviceError(format!(
            "minor {minor} not found in /proc/drbd"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unconfigured() {
        let status = DrbdStatus::parse_line(" 20: cs:Unconfigured").unwrap();
        assert!(status.is_standalone() == false);
        assert!(matches!(status.cstate, ConnState::Unconfigured));
    }

    #[test]
    fn parses_connected_uptodate() {
        let line = " 20: cs:Connected ro:Primary/Secondary ds:UpToDate/UpToDate C r-----";
        let status = DrbdStatus::parse_line(line).unwrap();
        assert!(status.is_connected());
        assert!(status.is_disk_uptodate());
        assert!(!status.is_ldisk());
    }

    #[test]
    fn parses_syncsource_with_percent_and_eta() {
        let line = " 20: cs:SyncSource ro:Primary/Secondary ds:UpToDate/Inconsistent C r-----\n\
                    \t[>....................] sync'ed:  5.1% (900/950)M\n\
                    \tfinish: 0:02:15 speed: 6,000 (6,000) K/sec";
        let status = DrbdStatus::parse_line(line.lines().next().unwrap());
        // first line alone has no sync info; exercise via for_minor-style combined text
        assert!(status.is_ok());
        let full = DrbdStatus::parse_line_with_sync_context(line).unwrap();
        assert_eq!(full.sync_percent, Some(5.1));
        assert_eq!(full.eta_seconds, Some(135));
    }
}

impl DrbdStatus {
    /// Like `parse_line`, but scans the full (possibly multi-line) minor
    /// block for the `sync'ed:`/`finish:` line, for tests and callers that
    /// retain the raw multi-line block instead of pre-joining it.
    #[doc(hidden)]
    pub fn parse_line_with_sync_context(block: &str) -> Result<Self> {
        let first = block.lines().next().unwrap_or(block);
        let mut status = Self::parse_line(first)?;
        if status.is_in_resync() {
            if let Some(sc) = SYNC_RE.captures(block) {
                let pct: f64 = sc[1].parse().unwrap_or(0.0);
                let h: u64 = sc[2].parse().unwrap_or(0);
                let m: u64 = sc[3].parse().unwrap_or(0);
                let s: u64 = sc[4].parse().unwrap_or(0);
                status.sync_percent = Some(pct);
                status.eta_seconds = Some(h * 3600 + m * 60 + s);
            }
        }
        Ok(status)
    }
}
