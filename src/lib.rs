//! s3-mirror - bulk object-store synchronizer
//!
//! Keeps a local directory consistent with a remote S3 bucket prefix at high
//! throughput on a single host. The mirror is fingerprinted with
//! ETag-compatible multi-part MD5 hashes, the bucket is enumerated and
//! diffed against those fingerprints, and only missing or changed objects
//! are downloaded — each through parallel ranged fetches, with gzip archives
//! optionally expanded in flight before they reach the disk.
//!
//! # Features
//!
//! - **ETag-compatible fingerprints**: Local files hash exactly the way the
//!   store ETags them, parts included, so unchanged objects never transfer
//! - **Parallel range downloads**: Every object fetches `ceil(size/chunk)`
//!   ranges concurrently
//! - **In-flight decompression**: gzip archives expand in memory on the way
//!   to the mirror
//! - **Progress tracking**: Byte-accurate counters with ETA
//! - **Automatic retry**: Bounded retries for listing pages and part fetches
//!
//! # Example
//!
//! ```no_run
//! use s3_mirror::{run, Configuration};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = Configuration::load("config1.json")?;
//! cfg.validate()?;
//! let summary = run(&cfg).await?;
//! println!("{summary}");
//! # Ok(())
//! # }
//! ```

mod archive;
mod cache;
mod config;
mod downloader;
mod error;
mod etag;
mod file;
mod lister;
mod orchestrator;
mod pool;
mod progress;
mod remote;
mod sink;
mod utils;
mod workset;
mod writer;

// Re-export public API
pub use cache::{CacheEntry, FileCache};
pub use config::Configuration;
pub use error::SyncError;
pub use etag::compute_etag;
pub use orchestrator::{run, Summary};
pub use remote::{ObjectStore, S3Store};
