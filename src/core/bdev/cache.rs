//! Node-local dev cache (§3, §6): a mapping from `/dev/...` path to (owner
//! instance, role, iv_name), written after each successful assemble/create
//! and removed after shutdown/remove. Purely advisory — readers must not
//! treat it as authoritative.

use crate::core::errors::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskRole {
    Primary,
    Secondary,
}

impl DiskRole {
    fn as_str(self) -> &'static str {
        match self {
            DiskRole::Primary => "primary",
            DiskRole::Secondary => "secondary",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub owner: String,
    pub role: DiskRole,
    pub iv_name: String,
}

/// Escapes a `/dev/...` path into a filesystem-safe cache file name, the
/// way the node backend names its per-device cache files.
fn escape_path(dev_path: &str) -> String {
    dev_path.replace('/', "_")
}

pub struct BdevCache {
    dir: PathBuf,
}

impl BdevCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, dev_path: &str) -> PathBuf {
        self.dir.join(format!("bdev_{}", escape_path(dev_path)))
    }

    /// Writes `<owner> <primary|secondary> <iv_name>` atomically (temp file
    /// + rename), matching the export/import archive's "write to `.new`,
    /// then rename" publication discipline used elsewhere in the node
    /// backend.
    pub async fn write(&self, dev_path: &str, entry: &CacheEntry) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let contents = format!("{} {} {}\n", entry.owner, entry.role.as_str(), entry.iv_name);
        let target = self.file_for(dev_path);
        let tmp = target.with_extension(format!("tmp-{}", rand::random::<u32>()));
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    pub async fn read(&self, dev_path: &str) -> Result<Option<CacheEntry>> {
        let target = self.file_for(dev_path);
        match tokio::fs::read_to_string(&target).await {
            Ok(contents) => Ok(Self::parse(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn parse(contents: &str) -> Option<CacheEntry> {
        let mut parts = contents.trim().splitn(3, ' ');
        let owner = parts.next()?.to_string();
        let role = DiskRole::parse(parts.next()?)?;
        let iv_name = parts.next()?.to_string();
        Some(CacheEntry { owner, role, iv_name })
    }

    pub async fn remove(&self, dev_path: &str) -> Result<()> {
        let target = self.file_for(dev_path);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scans every cache file and returns the ones owned by `instance_name`,
    /// paired with the best-effort unescaped `/dev/...` path (§4.7
    /// `drbd_wait_sync`/`blockdev_getmirrorstatus`: the node daemon has no
    /// cluster-wide state of its own, so "which devices belong to this
    /// instance" is answered by scanning the advisory cache rather than by
    /// consulting a config it doesn't hold).
    pub async fn list_for_owner(&self, instance_name: &str) -> Result<Vec<(String, CacheEntry)>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(escaped) = name.strip_prefix("bdev_") else {
                continue;
            };
            if name.ends_with(".tmp") || escaped.contains(".tmp-") {
                continue;
            }
            let contents = match tokio::fs::read_to_string(entry.path()).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            let Some(parsed) = Self::parse(&contents) else {
                continue;
            };
            if parsed.owner == instance_name {
                out.push((escaped.replace('_', "/"), parsed));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_slashes() {
        assert_eq!(escape_path("/dev/vg0/uniq_data"), "_dev_vg0_uniq_data");
    }

    #[test]
    fn parses_written_line() {
        let entry = CacheEntry {
            owner: "i.example.com".into(),
            role: DiskRole::Primary,
            iv_name: "disk/0".into(),
        };
        let line = format!("{} {} {}\n", entry.owner, entry.role.as_str(), entry.iv_name);
        let parsed = BdevCache::parse(&line).unwrap();
        assert_eq!(parsed.owner, "i.example.com");
        assert_eq!(parsed.role, DiskRole::Primary);
        assert_eq!(parsed.iv_name, "disk/0");
    }

    #[tokio::test]
    async fn write_read_remove_roundtrip() {
        let dir = std::env::temp_dir().join(format!("bdev-cache-test-{}", rand::random::<u32>()));
        let cache = BdevCache::new(&dir);
        let entry = CacheEntry {
            owner: "i.example.com".into(),
            role: DiskRole::Secondary,
            iv_name: "disk/0".into(),
        };
        cache.write("/dev/vg0/uniq_data", &entry).await.unwrap();
        let read_back = cache.read("/dev/vg0/uniq_data").await.unwrap().unwrap();
        assert_eq!(read_back.owner, entry.owner);
        cache.remove("/dev/vg0/uniq_data").await.unwrap();
        assert!(cache.read("/dev/vg0/uniq_data").await.unwrap().is_none());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
