//! Local mirror fingerprinting (stage L1).
//!
//! Walks the mirror root, computes an ETag-compatible hash for every file
//! that passes the filters, and keeps the results in a map the lister diffs
//! against. Matched entries are removed by the lister, so whatever is left
//! at the end exists only locally.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::warn;
use walkdir::WalkDir;

use crate::config::Configuration;
use crate::error::SyncError;
use crate::etag::compute_etag;
use crate::pool::WorkerPool;
use crate::utils::{canonical_name, format_bytes, has_valid_extension, has_valid_name};

/// Fingerprint of one local file. Plain values only; the cache never holds
/// pooled entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub etag: String,
    pub size: i64,
}

/// The local fingerprint map, shared read-heavy after population.
#[derive(Default)]
pub struct FileCache {
    files: RwLock<HashMap<String, CacheEntry>>,
    total_size: AtomicI64,
    scanned: AtomicU32,
    skipped: AtomicU32,
    load_time: Mutex<Duration>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: String, etag: String, size: i64) {
        let mut files = self.files.write().expect("cache poisoned");
        files.insert(key, CacheEntry { etag, size });
        self.total_size.fetch_add(size, Ordering::AcqRel);
    }

    /// Read-only membership check: name, ETag and size must all match.
    pub fn has(&self, key: &str, etag: &str, size: i64) -> bool {
        let files = self.files.read().expect("cache poisoned");
        files
            .get(key)
            .is_some_and(|entry| entry.etag == etag && entry.size == size)
    }

    /// Drops a consumed entry so later pages cannot match it twice.
    pub fn remove(&self, key: &str) -> bool {
        let mut files = self.files.write().expect("cache poisoned");
        if let Some(entry) = files.remove(key) {
            self.total_size.fetch_sub(entry.size, Ordering::AcqRel);
            return true;
        }
        false
    }

    pub fn clear(&self) {
        let mut files = self.files.write().expect("cache poisoned");
        files.clear();
        self.total_size.store(0, Ordering::Release);
    }

    pub fn count(&self) -> usize {
        self.files.read().expect("cache poisoned").len()
    }

    pub fn total_size(&self) -> i64 {
        self.total_size.load(Ordering::Acquire)
    }

    pub fn scanned(&self) -> u32 {
        self.scanned.load(Ordering::Acquire)
    }

    pub fn skipped(&self) -> u32 {
        self.skipped.load(Ordering::Acquire)
    }

    /// Walks `root` and fingerprints every matching file.
    ///
    /// A worker group of `numCPU` tasks hashes files off a path channel
    /// while the walk feeds it. Per-file errors are logged and counted as
    /// skipped; only a root that cannot be traversed fails the stage.
    pub async fn load_from_dir(
        self: Arc<Self>,
        root: &Path,
        cfg: &Configuration,
        token: CancellationToken,
    ) -> Result<(), SyncError> {
        let start = Instant::now();
        let chunk_size = cfg.chunk_size();
        let with_parts = cfg.with_parts;
        let extensions = cfg.extension_list();
        let name_mask = cfg.name_mask.clone();
        let root = root.to_path_buf();

        let cache = self.clone();
        let hash_root = root.clone();
        let pool = WorkerPool::spawn(
            cfg.num_cpu(),
            cfg.num_cpu() * 2,
            token.clone(),
            move |path: PathBuf| {
                let cache = cache.clone();
                let root = hash_root.clone();
                async move {
                    cache.scanned.fetch_add(1, Ordering::AcqRel);
                    let hashed = tokio::task::spawn_blocking(move || {
                        let size = std::fs::metadata(&path)?.len() as i64;
                        let etag = compute_etag(&path, chunk_size, with_parts)?;
                        let relative = path.strip_prefix(&root).unwrap_or(&path);
                        let key = canonical_name(&relative.to_string_lossy());
                        Ok::<_, std::io::Error>((key, etag, size))
                    })
                    .await;
                    match hashed {
                        Ok(Ok((key, etag, size))) => cache.add(key, etag, size),
                        Ok(Err(err)) => {
                            warn!("skipping local file: {err}");
                            cache.skipped.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(err) => {
                            warn!("hash task failed: {err}");
                            cache.skipped.fetch_add(1, Ordering::AcqRel);
                        }
                    }
                }
            },
        );

        let paths = pool.sender();
        let skip_count = self.clone();
        let walk = tokio::task::spawn_blocking(move || -> Result<(), SyncError> {
            for entry in WalkDir::new(&root).follow_links(true) {
                let entry = match entry {
                    Ok(entry) => entry,
                    // An unreadable root kills the stage; deeper errors skip.
                    Err(err) if err.depth() == 0 => {
                        return Err(SyncError::Io(std::io::Error::other(err)));
                    }
                    Err(err) => {
                        warn!("walk error under mirror root: {err}");
                        skip_count.skipped.fetch_add(1, Ordering::AcqRel);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy();
                if !has_valid_extension(&name, &extensions) || !has_valid_name(&name, &name_mask)
                {
                    continue;
                }
                if paths.send_blocking(entry.into_path()).is_err() {
                    break;
                }
            }
            Ok(())
        });

        let walk_result = walk
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;
        pool.close_and_wait().await;
        *self.load_time.lock().expect("load time poisoned") = start.elapsed();
        walk_result
    }
}

impl fmt::Display for FileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.count();
        let load_time = *self.load_time.lock().expect("load time poisoned");
        if count > 0 {
            write!(
                f,
                "Data: [{}] file(s). Skipped [{}] file(s). Total size: [{}]. Loaded in: {:?}",
                count,
                self.skipped(),
                format_bytes(self.total_size()),
                load_time
            )
        } else {
            write!(
                f,
                "No matching files in the cache. Scanned {} file(s). Elapsed: {:?}",
                self.scanned(),
                load_time
            )
        }
    }
}
