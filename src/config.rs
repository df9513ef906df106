//! Run configuration, deserialized from a JSON document.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::SyncError;

pub const KIB: i64 = 1 << 10;
pub const MIB: i64 = 1 << 20;

const DEFAULT_DOWNLOAD_PATH: &str = "/tmp/crawler";
const DEFAULT_MAX_KEYS: i32 = 1000;
const DEFAULT_CHUNK_SIZE_MB: i64 = 8;
const DEFAULT_PROGRESS_DELAY_MS: u64 = 250;
const MIN_PROGRESS_DELAY_MS: u64 = 100;

/// Hard ceiling on the download worker count, whatever the config says.
const MAX_DOWNLOADERS: usize = 9000;

/// Remote-store address and credentials. All fields are required.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Connection {
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// Listing and part-size settings.
///
/// `chunk_size_mb` is both the local-hash part size and the multi-part
/// download part size; it must equal the uploader's part size for ETag
/// equivalence.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Pagination {
    #[serde(rename = "maxKeys")]
    pub max_keys: i32,
    #[serde(rename = "maxPages")]
    pub max_pages: u32,
    #[serde(rename = "chunkSizeMB")]
    pub chunk_size_mb: i64,
}

/// Progress ticker settings. `delay` is in milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressSettings {
    pub delay: u64,
    pub bar_size: usize,
    pub with_progress_bar: bool,
}

/// Configuration for a mirror run.
///
/// # Example
///
/// ```no_run
/// use s3_mirror::Configuration;
///
/// let cfg = Configuration::load("config1.json").expect("config");
/// cfg.validate().expect("valid config");
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    #[serde(rename = "s3Connection")]
    pub s3_connection: S3Connection,
    #[serde(rename = "bucketName")]
    pub bucket_name: String,
    /// Key prefix filter; empty lists the whole bucket.
    #[serde(rename = "s3prefix")]
    pub s3_prefix: String,
    /// Comma-separated extension list; empty accepts everything.
    pub extensions: String,
    /// Case-insensitive substring filter on object names.
    #[serde(rename = "nameMask")]
    pub name_mask: String,
    #[serde(rename = "downloadPath")]
    pub download_path: String,
    #[serde(rename = "maxFileSizeMB")]
    pub max_file_size_mb: i64,
    #[serde(rename = "minFileSizeMB")]
    pub min_file_size_mb: i64,
    pub pagination: Pagination,
    /// Download worker count; 0 picks a heuristic from the CPU count.
    pub downloaders: usize,
    /// Scheduling hint for the runtime; 0 means detected CPU count.
    #[serde(rename = "numCPU")]
    pub num_cpu: usize,
    pub decompress: bool,
    #[serde(rename = "decompressWithDirName")]
    pub decompress_with_dir_name: bool,
    #[serde(rename = "saveArchives")]
    pub save_archives: bool,
    /// When false, large files hash with a single MD5 instead of parts.
    #[serde(rename = "withParts")]
    pub with_parts: bool,
    /// Replace path separators with `_` in destination basenames.
    #[serde(rename = "isFlattenName")]
    pub is_flatten_name: bool,
    pub progress: ProgressSettings,
}

impl Configuration {
    /// Loads a configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SyncError> {
        let file = File::open(path.as_ref())?;
        let cfg = serde_json::from_reader(BufReader::new(file))?;
        Ok(cfg)
    }

    /// Checks the fields that must be present before any I/O starts.
    pub fn validate(&self) -> Result<(), SyncError> {
        let conn = &self.s3_connection;
        if conn.endpoint.is_empty() {
            return Err(SyncError::Config("s3Connection.endpoint is required".into()));
        }
        if conn.region.is_empty() {
            return Err(SyncError::Config("s3Connection.region is required".into()));
        }
        if conn.access_key_id.is_empty() || conn.secret_access_key.is_empty() {
            return Err(SyncError::Config("s3Connection credentials are required".into()));
        }
        if self.bucket_name.is_empty() {
            return Err(SyncError::Config("bucketName is required".into()));
        }
        if self.min_file_size_mb < 0 || self.max_file_size_mb < 0 {
            return Err(SyncError::Config("file size bounds must not be negative".into()));
        }
        if self.max_file_size_mb > 0 && self.min_file_size_mb > self.max_file_size_mb {
            return Err(SyncError::Config(
                "minFileSizeMB exceeds maxFileSizeMB".into(),
            ));
        }
        Ok(())
    }

    /// Local mirror root, defaulted when the config leaves it empty.
    pub fn download_path(&self) -> &str {
        if self.download_path.is_empty() {
            DEFAULT_DOWNLOAD_PATH
        } else {
            &self.download_path
        }
    }

    /// Part size in bytes for both hashing and ranged downloads.
    pub fn chunk_size(&self) -> i64 {
        let mb = if self.pagination.chunk_size_mb > 0 {
            self.pagination.chunk_size_mb
        } else {
            DEFAULT_CHUNK_SIZE_MB
        };
        mb * MIB
    }

    pub fn max_keys(&self) -> i32 {
        if self.pagination.max_keys > 0 {
            self.pagination.max_keys
        } else {
            DEFAULT_MAX_KEYS
        }
    }

    /// Inclusive size bounds in bytes; zero means unbounded on that side.
    pub fn size_bounds(&self) -> (i64, i64) {
        (self.min_file_size_mb * MIB, self.max_file_size_mb * MIB)
    }

    /// Extension tokens from the comma-separated config string.
    pub fn extension_list(&self) -> Vec<String> {
        self.extensions
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Detected or configured CPU count; never zero.
    pub fn num_cpu(&self) -> usize {
        if self.num_cpu > 0 {
            return self.num_cpu;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    /// Download worker count.
    ///
    /// Zero selects a heuristic from the CPU count: 128 on a single core,
    /// 192 up to 16 cores, 512 beyond, halved when decompression is on.
    /// The result is always capped at [`MAX_DOWNLOADERS`].
    pub fn downloaders(&self) -> usize {
        let mut count = if self.downloaders > 0 {
            self.downloaders
        } else {
            let picked = match self.num_cpu() {
                1 => 128,
                n if n <= 16 => 192,
                _ => 512,
            };
            if self.decompress {
                picked / 2
            } else {
                picked
            }
        };
        if count > MAX_DOWNLOADERS {
            count = MAX_DOWNLOADERS;
        }
        count
    }

    /// Progress ticker interval with the 100 ms floor enforced.
    pub fn progress_delay(&self) -> Duration {
        let ms = match self.progress.delay {
            0 => DEFAULT_PROGRESS_DELAY_MS,
            d if d < MIN_PROGRESS_DELAY_MS => MIN_PROGRESS_DELAY_MS,
            d => d,
        };
        Duration::from_millis(ms)
    }
}
