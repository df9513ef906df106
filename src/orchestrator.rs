//! Main orchestration logic for one mirror run.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::archive::Decompressor;
use crate::cache::FileCache;
use crate::config::Configuration;
use crate::downloader::Downloader;
use crate::error::SyncError;
use crate::file::Layout;
use crate::lister::{self, PageRetry};
use crate::pool::{BufferPool, EntryPool};
use crate::progress;
use crate::remote::{ObjectStore, S3Store};
use crate::sink::DiskSink;
use crate::utils::{create_path, format_bytes};
use crate::workset::WorkSet;

/// One deadline covers the whole run.
pub const RUN_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// What a finished run did, for the exit summary line.
#[derive(Debug, Clone, Copy)]
pub struct Summary {
    pub downloaded: u32,
    pub failed: u32,
    pub total_bytes: i64,
    pub elapsed: Duration,
    /// Bytes per second over the whole run.
    pub average_speed: f64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Downloaded {} file(s), {} failed. {} in {:.1?} ({}/s avg)",
            self.downloaded,
            self.failed,
            format_bytes(self.total_bytes),
            self.elapsed,
            format_bytes(self.average_speed as i64)
        )
    }
}

/// Synchronizes the configured bucket prefix into the local mirror.
///
/// This is the entry point for a run: it fingerprints the mirror, probes the
/// bucket, lists and diffs the remote, and drives the download, decompress
/// and disk-sink pools to completion.
///
/// # Example
///
/// ```no_run
/// use s3_mirror::{run, Configuration};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cfg = Configuration::load("config1.json")?;
/// cfg.validate()?;
/// let summary = run(&cfg).await?;
/// println!("{summary}");
/// # Ok(())
/// # }
/// ```
pub async fn run(cfg: &Configuration) -> Result<Summary, SyncError> {
    let store = Arc::new(S3Store::connect(cfg).await?);
    run_with_store(cfg, store, CancellationToken::new()).await
}

/// Run body over any store implementation; the token cancels everything.
pub(crate) async fn run_with_store(
    cfg: &Configuration,
    store: Arc<dyn ObjectStore>,
    token: CancellationToken,
) -> Result<Summary, SyncError> {
    let started = Instant::now();
    let layout = Layout {
        root: cfg.download_path().into(),
        flatten: cfg.is_flatten_name,
        decompress: cfg.decompress,
        with_dir_name: cfg.decompress_with_dir_name,
    };
    create_path(cfg.download_path())?;

    let deadline = token.clone();
    let watchdog = tokio::spawn(async move {
        tokio::time::sleep(RUN_DEADLINE).await;
        warn!("run deadline reached, cancelling");
        deadline.cancel();
    });

    // The cache must be complete before the first page is diffed.
    let cache = Arc::new(FileCache::new());
    cache
        .clone()
        .load_from_dir(Path::new(cfg.download_path()), cfg, token.clone())
        .await?;
    info!("{cache}");

    store.bucket_exists().await?;

    let work = Arc::new(WorkSet::new());
    let entries = Arc::new(EntryPool::new(Arc::new(BufferPool::new())));
    let downloaders = cfg.downloaders();
    let cpu_workers = cfg.num_cpu();

    // Pools wire back to front so each stage owns a sender to the next.
    let sink = Arc::new(DiskSink {
        entries: entries.clone(),
        token: token.clone(),
    });
    let sink_pool = sink.spawn_pool(cpu_workers);

    let decompressor = Arc::new(Decompressor {
        entries: entries.clone(),
        layout: layout.clone(),
        save_archives: cfg.save_archives,
        sink: sink_pool.sender(),
        token: token.clone(),
    });
    let archive_pool = decompressor.spawn_pool(downloaders);

    let downloader = Arc::new(Downloader {
        store: store.clone(),
        work: work.clone(),
        entries: entries.clone(),
        layout: layout.clone(),
        chunk_size: cfg.chunk_size(),
        archives: archive_pool.sender(),
        sink: sink_pool.sender(),
        token: token.clone(),
    });
    let download_pool = downloader.spawn_pool(downloaders);

    let ticker_token = token.child_token();
    let ticker = tokio::spawn(progress::run_ticker(
        work.clone(),
        progress::new_printer(cfg),
        cfg.progress_delay(),
        started,
        ticker_token.clone(),
    ));

    let list_result = lister::list_and_diff(
        store,
        cfg,
        &layout,
        &cache,
        &work,
        &entries,
        download_pool.sender(),
        PageRetry::default(),
        token.clone(),
    )
    .await;

    // Queues close in topological order: as each pool's workers exit they
    // drop their senders into the next stage, closing that queue in turn.
    download_pool.close_and_wait().await;
    archive_pool.close_and_wait().await;
    sink_pool.close_and_wait().await;

    ticker_token.cancel();
    let _ = ticker.await;
    watchdog.abort();

    list_result?;
    if token.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    if cache.count() > 0 {
        info!(
            "{} local file(s) have no remote counterpart",
            cache.count()
        );
    }
    if work.archive_count() > 0 {
        info!("{} archive(s) went through decompression", work.archive_count());
    }

    let elapsed = started.elapsed();
    let stats = work.statistics(elapsed);
    Ok(Summary {
        downloaded: stats.downloaded,
        failed: stats.failed,
        total_bytes: stats.progress_bytes,
        elapsed,
        average_speed: stats.average_speed,
    })
}
