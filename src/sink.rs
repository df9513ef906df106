//! Disk writer pool (stage L5).
//!
//! Terminal stage for entries whose body is in memory: small files and
//! decompressed archives. Each worker flushes one body to its destination
//! and returns the entry to the pool, on error paths included.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::SyncError;
use crate::file::FileEntry;
use crate::pool::{EntryPool, WorkerPool};

pub struct DiskSink {
    pub entries: Arc<EntryPool>,
    pub token: CancellationToken,
}

impl DiskSink {
    /// Spawns the bounded writer pool; `workers` is the CPU count.
    pub fn spawn_pool(self: Arc<Self>, workers: usize) -> WorkerPool<FileEntry> {
        let token = self.token.clone();
        WorkerPool::spawn(workers, 512, token, move |entry| {
            let sink = self.clone();
            async move { sink.handle(entry).await }
        })
    }

    async fn handle(&self, entry: FileEntry) {
        if let Err(err) = self.flush(&entry).await {
            error!("disk write error for {}: {err}", entry.key);
        }
        self.entries.release(entry);
    }

    async fn flush(&self, entry: &FileEntry) -> Result<(), SyncError> {
        let body = entry
            .body
            .as_deref()
            .ok_or_else(|| SyncError::Remote(format!("{}: no body to write", entry.key)))?;
        tokio::fs::create_dir_all(&entry.dir).await?;
        let dest = entry.dest_path();
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&dest)
            .await?;
        file.write_all(body).await?;
        file.flush().await?;
        debug!("flushed {} ({} bytes)", dest.display(), body.len());
        Ok(())
    }
}
