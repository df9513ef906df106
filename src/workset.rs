//! Accounting for the diff result and download progress.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::file::FileEntry;

/// Shared counters for everything that passed the diff.
///
/// Totals grow only while the lister runs; `bytes_so_far` grows from the
/// progress writers; the downloaded set and failure count grow from the
/// download workers. Per-item partial byte counts live in each item's
/// progress writer.
#[derive(Default)]
pub struct WorkSet {
    total_bytes: AtomicI64,
    count: AtomicU32,
    archives: AtomicU32,
    failed: AtomicU32,
    bytes_so_far: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
    downloaded: Mutex<HashSet<String>>,
}

/// Point-in-time view for the progress printer and the exit summary.
#[derive(Debug, Clone, Copy)]
pub struct Statistics {
    pub count: u32,
    pub downloaded: u32,
    pub failed: u32,
    pub remaining: u32,
    pub total_bytes: i64,
    pub progress_bytes: i64,
    pub average_speed: f64,
    pub ratio: f64,
    pub active: usize,
}

impl WorkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts one entry admitted to the download queue.
    pub fn add_expected(&self, entry: &FileEntry) {
        self.total_bytes.fetch_add(entry.size, Ordering::AcqRel);
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn note_archive(&self) {
        self.archives.fetch_add(1, Ordering::AcqRel);
    }

    /// The shared byte counter progress writers add into.
    pub fn bytes_counter(&self) -> Arc<AtomicU64> {
        self.bytes_so_far.clone()
    }

    /// Marks a worker busy until the returned guard drops.
    pub fn active_guard(&self) -> ActiveGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ActiveGuard {
            active: self.active.clone(),
        }
    }

    pub fn mark_downloaded(&self, key: &str) {
        self.downloaded
            .lock()
            .expect("downloaded set poisoned")
            .insert(key.to_string());
    }

    pub fn is_downloaded(&self, key: &str) -> bool {
        self.downloaded
            .lock()
            .expect("downloaded set poisoned")
            .contains(key)
    }

    pub fn mark_failed(&self) {
        self.failed.fetch_add(1, Ordering::AcqRel);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn archive_count(&self) -> u32 {
        self.archives.load(Ordering::Acquire)
    }

    pub fn failed_count(&self) -> u32 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn downloaded_count(&self) -> u32 {
        self.downloaded.lock().expect("downloaded set poisoned").len() as u32
    }

    pub fn total_bytes(&self) -> i64 {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn bytes_so_far(&self) -> u64 {
        self.bytes_so_far.load(Ordering::Acquire)
    }

    pub fn statistics(&self, elapsed: Duration) -> Statistics {
        let count = self.count();
        let downloaded = self.downloaded_count();
        let failed = self.failed_count();
        let total_bytes = self.total_bytes();
        let progress_bytes = self.bytes_so_far() as i64;
        let ratio = if total_bytes > 0 {
            progress_bytes as f64 / total_bytes as f64
        } else {
            0.0
        };
        let average_speed = if elapsed.as_secs_f64() > 0.0 {
            progress_bytes as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        Statistics {
            count,
            downloaded,
            failed,
            remaining: count.saturating_sub(downloaded + failed),
            total_bytes,
            progress_bytes,
            average_speed,
            ratio,
            active: self.active.load(Ordering::Acquire),
        }
    }
}

/// Decrements the active-worker gauge when dropped.
pub struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
