//! Download worker pool (stage L3).
//!
//! Each worker pops one entry and picks a path for it: small files and
//! decompress-bound archives download into a pooled in-memory arena, larger
//! files stream straight to their destination through positional writes.
//! Both paths fetch `ceil(size / chunk)` byte ranges in parallel and count
//! progress through the same writer.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::SyncError;
use crate::file::{FileEntry, Layout};
use crate::pool::{EntryPool, WorkerPool};
use crate::remote::ObjectStore;
use crate::workset::WorkSet;
use crate::writer::{ProgressWriter, SharedBuffer, WriteAt};

/// Attempts per ranged part fetch.
const PART_ATTEMPTS: usize = 3;
const PART_BACKOFF_MS: u64 = 1000;

/// Everything a download worker needs, shared across the pool.
pub struct Downloader {
    pub store: Arc<dyn ObjectStore>,
    pub work: Arc<WorkSet>,
    pub entries: Arc<EntryPool>,
    pub layout: Layout,
    pub chunk_size: i64,
    pub archives: async_channel::Sender<FileEntry>,
    pub sink: async_channel::Sender<FileEntry>,
    pub token: CancellationToken,
}

impl Downloader {
    /// Spawns the worker pool over the download queue.
    pub fn spawn_pool(self: Arc<Self>, workers: usize) -> WorkerPool<FileEntry> {
        let token = self.token.clone();
        WorkerPool::spawn(workers, workers.max(2) * 2, token, move |entry| {
            let downloader = self.clone();
            async move { downloader.handle(entry).await }
        })
    }

    async fn handle(&self, mut entry: FileEntry) {
        let _active = self.work.active_guard();
        if self.work.is_downloaded(&entry.key) {
            self.entries.release(entry);
            return;
        }
        let to_memory = entry.is_small || (entry.is_archive() && self.layout.decompress);
        let result = if to_memory {
            self.download_to_memory(&mut entry).await
        } else {
            self.download_to_disk(&entry).await
        };

        match result {
            Ok(()) => {
                self.work.mark_downloaded(&entry.key);
                debug!("downloaded {} ({} bytes)", entry.key, entry.size);
                self.route(entry).await;
            }
            Err(err) => {
                error!("download error for {}: {err}", entry.key);
                self.work.mark_failed();
                self.entries.release(entry);
            }
        }
    }

    /// Hands a finished entry to its terminal queue. Bodies go to the
    /// decompressor or the disk sink; the direct-to-disk path is already
    /// terminal, so the entry just returns to the pool.
    async fn route(&self, entry: FileEntry) {
        if entry.body.is_none() {
            self.entries.release(entry);
            return;
        }
        let queue = if entry.is_archive() && self.layout.decompress {
            &self.archives
        } else {
            &self.sink
        };
        if let Err(returned) = queue.send(entry).await {
            self.entries.release(returned.into_inner());
        }
    }

    /// Small-file path: pooled arena pre-extended to the object size, part
    /// writes land positionally, completion requires an exact byte count.
    async fn download_to_memory(&self, entry: &mut FileEntry) -> Result<(), SyncError> {
        let size = entry.size.max(0) as u64;
        let arena = SharedBuffer::new(self.entries.buffers().acquire(), size as usize);
        let writer = Arc::new(ProgressWriter::new(arena, self.work.bytes_counter()));

        let fetched = self.fetch_parts(&entry.key, size, writer.clone()).await;
        let writer = Arc::into_inner(writer)
            .ok_or_else(|| SyncError::Remote(format!("{}: part writer leaked", entry.key)))?;
        let (arena, written) = writer.into_parts();
        let buffer = arena.into_inner();

        match fetched {
            Err(err) => {
                self.entries.buffers().release(buffer);
                Err(err)
            }
            Ok(()) if written != size => {
                self.entries.buffers().release(buffer);
                Err(SyncError::SizeMismatch {
                    key: entry.key.clone(),
                    expected: entry.size,
                    written,
                })
            }
            Ok(()) => {
                entry.body = Some(buffer);
                Ok(())
            }
        }
    }

    /// Large-file path: pre-allocate the destination and write parts in
    /// place. A partial download never survives on disk.
    async fn download_to_disk(&self, entry: &FileEntry) -> Result<(), SyncError> {
        let size = entry.size.max(0) as u64;
        let dest = entry.dest_path();
        tokio::fs::create_dir_all(&entry.dir).await?;
        let file = std::fs::File::create(&dest)?;
        file.set_len(size)?;
        let writer = Arc::new(ProgressWriter::new(file, self.work.bytes_counter()));

        let fetched = self.fetch_parts(&entry.key, size, writer.clone()).await;
        let writer = Arc::into_inner(writer)
            .ok_or_else(|| SyncError::Remote(format!("{}: part writer leaked", entry.key)))?;
        let (file, written) = writer.into_parts();
        drop(file);

        let result = match fetched {
            Err(err) => Err(err),
            Ok(()) if written != size => Err(SyncError::SizeMismatch {
                key: entry.key.clone(),
                expected: entry.size,
                written,
            }),
            Ok(()) => Ok(()),
        };
        if result.is_err() {
            let _ = tokio::fs::remove_file(&dest).await;
        }
        result
    }

    /// Fetches every `chunk_size` range of the object concurrently into the
    /// writer. The first failure wins; remaining parts still run to
    /// completion before it is reported.
    async fn fetch_parts<W: WriteAt + 'static>(
        &self,
        key: &str,
        size: u64,
        writer: Arc<ProgressWriter<W>>,
    ) -> Result<(), SyncError> {
        let chunk = self.chunk_size.max(1) as u64;
        let parts = size.div_ceil(chunk);
        let mut tasks = JoinSet::new();
        for part in 0..parts {
            let start = part * chunk;
            let end = (start + chunk - 1).min(size - 1);
            let store = self.store.clone();
            let token = self.token.clone();
            let writer = writer.clone();
            let key = key.to_string();
            tasks.spawn(async move { fetch_part(&*store, &key, start, end, &writer, &token).await });
        }

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failure.get_or_insert(err);
                }
                Err(join_err) => {
                    failure.get_or_insert(SyncError::Remote(join_err.to_string()));
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }
}

/// One ranged fetch with its own retry budget. A short or failed response
/// retries without writing, so the byte counter stays monotonic and exact.
async fn fetch_part<W: WriteAt>(
    store: &dyn ObjectStore,
    key: &str,
    start: u64,
    end: u64,
    writer: &ProgressWriter<W>,
    token: &CancellationToken,
) -> Result<(), SyncError> {
    let expected = end - start + 1;
    let strategy = FixedInterval::from_millis(PART_BACKOFF_MS).take(PART_ATTEMPTS - 1);

    let fetch = Retry::spawn(strategy, || async move {
        match store.get_range(key, start, end).await {
            Ok(bytes) if bytes.len() as u64 == expected => Ok(bytes),
            Ok(bytes) => RetryError::to_transient(SyncError::Remote(format!(
                "{key}: short range response ({} of {expected} bytes)",
                bytes.len()
            ))),
            Err(err) => RetryError::to_transient(err),
        }
    });

    let bytes = tokio::select! {
        _ = token.cancelled() => return Err(SyncError::Cancelled),
        result = fetch => result?,
    };
    writer.write_at(&bytes, start)?;
    Ok(())
}
