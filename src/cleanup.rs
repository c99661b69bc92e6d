//! Bounded media cache directory.
//!
//! Each bundle is a directory directly under the cache root. Eviction is
//! least-recently-used: bundles touched by this process are ordered by touch
//! sequence, anything never touched is older than all of them and ordered by
//! modification time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_entries: usize,
    pub max_bytes: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self { max_entries: 20, max_bytes: 512 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<String>,
    pub freed_bytes: u64,
}

impl SweepReport {
    pub fn is_noop(&self) -> bool {
        self.evicted.is_empty()
    }
}

#[derive(Debug)]
struct Entry {
    key: String,
    path: PathBuf,
    bytes: u64,
    touched: Option<u64>,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct AccessLog {
    seq: u64,
    last: HashMap<String, u64>,
}

#[derive(Debug)]
pub struct CacheJanitor {
    root: PathBuf,
    limits: CacheLimits,
    access: Mutex<AccessLog>,
}

impl CacheJanitor {
    pub fn new(root: impl Into<PathBuf>, limits: CacheLimits) -> Self {
        Self { root: root.into(), limits, access: Mutex::new(AccessLog::default()) }
    }

    /// Record an access to `key`.
    pub fn touch(&self, key: &str) {
        let mut log = self.access.lock().unwrap_or_else(|e| e.into_inner());
        log.seq += 1;
        let seq = log.seq;
        log.last.insert(key.to_string(), seq);
    }

    /// Evict least-recently-used bundles until both limits hold. `pinned` is never evicted.
    pub fn sweep(&self, pinned: Option<&str>) -> Result<SweepReport> {
        let mut entries = self.scan()?;
        let mut total_bytes: u64 = entries.iter().map(|e| e.bytes).sum();
        let mut count = entries.len();
        let mut report = SweepReport::default();

        if count <= self.limits.max_entries && total_bytes <= self.limits.max_bytes {
            debug!("Media cache within bounds ({} bundles, {} bytes)", count, total_bytes);
            return Ok(report);
        }

        // Oldest first: never-touched (by mtime), then touched (by sequence)
        entries.sort_by(|a, b| match (a.touched, b.touched) {
            (None, None) => a.modified.cmp(&b.modified).then_with(|| a.key.cmp(&b.key)),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y),
        });

        for entry in entries.iter().filter(|e| Some(e.key.as_str()) != pinned) {
            if count <= self.limits.max_entries && total_bytes <= self.limits.max_bytes {
                break;
            }
            match std::fs::remove_dir_all(&entry.path) {
                Ok(()) => {
                    count -= 1;
                    total_bytes = total_bytes.saturating_sub(entry.bytes);
                    report.freed_bytes += entry.bytes;
                    report.evicted.push(entry.key.clone());
                }
                Err(e) => warn!("Failed to evict media bundle {}: {}", entry.path.display(), e),
            }
        }

        if !report.evicted.is_empty() {
            let mut log = self.access.lock().unwrap_or_else(|e| e.into_inner());
            for key in &report.evicted {
                log.last.remove(key);
            }
            info!(
                "Evicted {} media bundles ({} bytes freed): {}",
                report.evicted.len(),
                report.freed_bytes,
                report.evicted.join(", ")
            );
        }
        if count > self.limits.max_entries || total_bytes > self.limits.max_bytes {
            warn!("Media cache still over bounds after sweep ({} bundles, {} bytes)", count, total_bytes);
        }
        Ok(report)
    }

    /// Remove every bundle. Returns how many were removed.
    pub fn purge(&self) -> Result<usize> {
        let entries = self.scan()?;
        let mut removed = 0;
        for entry in &entries {
            match std::fs::remove_dir_all(&entry.path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", entry.path.display(), e),
            }
        }
        self.access.lock().unwrap_or_else(|e| e.into_inner()).last.clear();
        info!("Purged {} media bundles from {}", removed, self.root.display());
        Ok(removed)
    }

    fn scan(&self) -> Result<Vec<Entry>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let log = self.access.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = Vec::new();
        for item in std::fs::read_dir(&self.root)? {
            let item = item?;
            let meta = item.metadata()?;
            if !meta.is_dir() {
                continue;
            }
            let key = item.file_name().to_string_lossy().into_owned();
            let path = item.path();
            entries.push(Entry {
                touched: log.last.get(&key).copied(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                bytes: dir_size(&path),
                key,
                path,
            });
        }
        Ok(entries)
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(read) = std::fs::read_dir(path) else {
        return 0;
    };
    read.flatten()
        .map(|e| match e.metadata() {
            Ok(m) if m.is_dir() => dir_size(&e.path()),
            Ok(m) => m.len(),
            Err(_) => 0,
        })
        .sum()
}
