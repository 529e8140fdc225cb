//! Offline cache directory administration
//!
//! These functions work on a cache directory directly, without opening a
//! [`CacheStore`](crate::cache::CacheStore), so they need no validator
//! version. They are meant for tooling run while no store has the directory
//! open.

use crate::cache::persist::{clear_dir, scan_dir};
use crate::cache::stats::MaintenanceReport;
use crate::error::{ModcheckError, ModcheckResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

/// What a cache directory holds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub dir: PathBuf,
    pub exists: bool,
    pub entries: usize,
    pub corrupt: usize,
    /// Bytes of readable entry files
    pub bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    /// Entry count per validator version
    pub versions: BTreeMap<String, usize>,
}

/// What [`prune`] removes besides unreadable files
#[derive(Debug, Clone, Default)]
pub struct PruneOptions {
    /// Remove entries older than this
    pub max_age: Option<Duration>,
    /// Remove entries written by any other validator version
    pub validator_version: Option<String>,
    /// Remove oldest entries until the directory fits (0 = unbounded)
    pub max_disk_bytes: u64,
}

/// Summarize the entries under `dir`. A missing directory is empty.
pub async fn inspect(dir: &Path) -> ModcheckResult<DiskUsage> {
    let mut usage = DiskUsage {
        dir: dir.to_path_buf(),
        ..DiskUsage::default()
    };
    if !fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(usage);
    }
    usage.exists = true;

    let scan = scan_dir(dir).await?;
    usage.corrupt = scan.corrupt.len();
    for entry in &scan.entries {
        let created = entry.header.created_at;
        usage.entries += 1;
        usage.bytes += entry.file_bytes;
        usage.oldest = Some(usage.oldest.map_or(created, |t| t.min(created)));
        usage.newest = Some(usage.newest.map_or(created, |t| t.max(created)));
        *usage
            .versions
            .entry(entry.header.validator_version.clone())
            .or_default() += 1;
    }
    Ok(usage)
}

/// Remove unreadable, expired, and foreign-version entries, then enforce the
/// byte budget oldest-first
pub async fn prune(dir: &Path, options: &PruneOptions) -> ModcheckResult<MaintenanceReport> {
    let mut report = MaintenanceReport::default();
    if !fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(report);
    }

    let scan = scan_dir(dir).await?;
    report.scanned = scan.entries.len() + scan.corrupt.len();
    let now = Utc::now();

    for path in &scan.corrupt {
        if remove(path).await {
            report.removed_corrupt += 1;
        }
    }

    let mut kept = Vec::with_capacity(scan.entries.len());
    for entry in scan.entries {
        let foreign = options
            .validator_version
            .as_deref()
            .is_some_and(|v| v != entry.header.validator_version);
        if foreign || entry.header.is_expired(now, options.max_age) {
            if remove(&entry.path).await {
                report.removed_stale += 1;
            }
        } else {
            kept.push(entry);
        }
    }

    let mut bytes: u64 = kept.iter().map(|e| e.file_bytes).sum();
    if options.max_disk_bytes > 0 && bytes > options.max_disk_bytes {
        kept.sort_by_key(|e| e.header.created_at);
        for entry in &kept {
            if bytes <= options.max_disk_bytes {
                break;
            }
            if remove(&entry.path).await {
                bytes -= entry.file_bytes;
                report.removed_for_budget += 1;
            }
        }
    }

    report.disk_bytes = bytes;
    debug!("Pruned {} files from {}", report.removed(), dir.display());
    Ok(report)
}

/// Remove every entry file under `dir`, returning how many were removed
pub async fn clear(dir: &Path) -> ModcheckResult<usize> {
    clear_dir(dir).await
}

async fn remove(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => {
            let err = ModcheckError::io(format!("removing {}", path.display()), e);
            warn!("{}", err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, CacheStore, ContentHash, Metadata, StoreOptions};
    use tempfile::TempDir;

    async fn populate(dir: &Path, version: &str, keys: &[&str]) {
        let options = StoreOptions::memory_only(1 << 20).with_dir(dir);
        let store: CacheStore<String> = CacheStore::open(options, version).await.unwrap();
        for key in keys {
            store
                .set(
                    &CacheKey::from(*key),
                    &ContentHash::of_bytes(key.as_bytes()),
                    &key.to_string(),
                    Metadata::default(),
                )
                .unwrap();
        }
        store.flush().await.unwrap();
    }

    #[tokio::test]
    async fn missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let usage = inspect(&dir.path().join("absent")).await.unwrap();
        assert!(!usage.exists);
        assert_eq!(usage.entries, 0);
    }

    #[tokio::test]
    async fn inspect_counts_versions() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), "1", &["a", "b"]).await;
        std::fs::write(dir.path().join("junk.entry"), b"junk").unwrap();

        let usage = inspect(dir.path()).await.unwrap();
        assert!(usage.exists);
        assert_eq!(usage.entries, 2);
        assert_eq!(usage.corrupt, 1);
        assert_eq!(usage.versions.get("1"), Some(&2));
        assert!(usage.bytes > 0);
        assert!(usage.oldest <= usage.newest);
    }

    #[tokio::test]
    async fn prune_removes_foreign_versions_and_junk() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), "1", &["a", "b"]).await;
        std::fs::write(dir.path().join("junk.entry"), b"junk").unwrap();

        let options = PruneOptions {
            validator_version: Some("2".to_string()),
            ..PruneOptions::default()
        };
        let report = prune(dir.path(), &options).await.unwrap();
        assert_eq!(report.removed_corrupt, 1);
        assert_eq!(report.removed_stale, 2);
        assert_eq!(inspect(dir.path()).await.unwrap().entries, 0);
    }

    #[tokio::test]
    async fn clear_empties_dir() {
        let dir = TempDir::new().unwrap();
        populate(dir.path(), "1", &["a", "b", "c"]).await;
        assert_eq!(clear(dir.path()).await.unwrap(), 3);
        assert_eq!(clear(dir.path()).await.unwrap(), 0);
    }
}
