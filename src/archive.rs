//! In-memory archive expansion (stage L4).

use std::io::Read;
use std::sync::Arc;

use flate2::read::GzDecoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::SyncError;
use crate::file::{FileEntry, Layout};
use crate::pool::{EntryPool, WorkerPool};

/// Decoder selected by archive extension.
///
/// Gzip is the only supported codec; every other archive extension lands on
/// `Unsupported` and is reported, not expanded.
pub enum Decoder {
    Gzip,
    Unsupported(String),
}

impl Decoder {
    pub fn for_extension(extension: &str) -> Decoder {
        match extension {
            ".gz" | ".gzip" => Decoder::Gzip,
            other => Decoder::Unsupported(other.to_string()),
        }
    }

    /// Expands `compressed` into `out`.
    pub fn decompress(&self, compressed: &[u8], out: &mut Vec<u8>) -> Result<(), SyncError> {
        match self {
            Decoder::Gzip => {
                let mut decoder = GzDecoder::new(compressed);
                decoder.read_to_end(out)?;
                Ok(())
            }
            Decoder::Unsupported(extension) => {
                Err(SyncError::UnsupportedArchive(extension.clone()))
            }
        }
    }
}

/// Shared state for the decompression worker pool.
pub struct Decompressor {
    pub entries: Arc<EntryPool>,
    pub layout: Layout,
    pub save_archives: bool,
    pub sink: async_channel::Sender<FileEntry>,
    pub token: CancellationToken,
}

impl Decompressor {
    /// Spawns the worker pool over the archive queue.
    pub fn spawn_pool(self: Arc<Self>, workers: usize) -> WorkerPool<FileEntry> {
        let token = self.token.clone();
        WorkerPool::spawn(workers, 512, token, move |entry| {
            let decompressor = self.clone();
            async move { decompressor.handle(entry).await }
        })
    }

    async fn handle(&self, mut entry: FileEntry) {
        match entry.body.take() {
            Some(compressed) => {
                if let Err(err) = self.expand_in_memory(&mut entry, compressed).await {
                    error!("decompress error for {}: {err}", entry.key);
                    self.entries.release(entry);
                    return;
                }
                if self.sink.send(entry).await.is_err() {
                    debug!("sink queue closed during decompression");
                }
            }
            None => {
                // The archive already sits on disk; expand it in place.
                if let Err(err) = self.expand_on_disk(&entry).await {
                    error!("decompress error for {}: {err}", entry.key);
                }
                self.entries.release(entry);
            }
        }
    }

    /// Swaps the entry's compressed body for its expansion. The compressed
    /// buffer goes back to the pool either way; when archives are kept, the
    /// compressed copy is first persisted to its plain destination.
    async fn expand_in_memory(
        &self,
        entry: &mut FileEntry,
        compressed: Vec<u8>,
    ) -> Result<(), SyncError> {
        if self.save_archives {
            let plain = entry.plain_dest_path(&self.layout);
            if let Err(err) = persist(&plain, &compressed).await {
                warn!("could not keep archive {}: {err}", plain.display());
            }
        }

        let decoder = Decoder::for_extension(&entry.extension);
        let out = self.entries.buffers().acquire();
        let expanded = tokio::task::spawn_blocking(move || {
            let mut out = out;
            let result = decoder.decompress(&compressed, &mut out);
            (result, compressed, out)
        })
        .await
        .map_err(|e| SyncError::Remote(format!("decompress task failed: {e}")))?;

        let (result, compressed, out) = expanded;
        self.entries.buffers().release(compressed);
        match result {
            Ok(()) => {
                debug!("expanded {} to {} bytes", entry.key, out.len());
                entry.body = Some(out);
                Ok(())
            }
            Err(err) => {
                self.entries.buffers().release(out);
                Err(err)
            }
        }
    }

    /// Disk variant: read the archive from its plain destination, write the
    /// expansion to the entry's decompressed destination, and drop the
    /// original unless archives are kept.
    async fn expand_on_disk(&self, entry: &FileEntry) -> Result<(), SyncError> {
        let source = entry.plain_dest_path(&self.layout);
        let compressed = tokio::fs::read(&source).await?;

        let decoder = Decoder::for_extension(&entry.extension);
        let out = self.entries.buffers().acquire();
        let (result, out) = tokio::task::spawn_blocking(move || {
            let mut out = out;
            let result = decoder.decompress(&compressed, &mut out);
            (result, out)
        })
        .await
        .map_err(|e| SyncError::Remote(format!("decompress task failed: {e}")))?;

        let written = match result {
            Ok(()) => persist(&entry.dest_path(), &out).await,
            Err(err) => Err(err),
        };
        self.entries.buffers().release(out);
        written?;

        if !self.save_archives {
            tokio::fs::remove_file(&source).await?;
        }
        Ok(())
    }
}

async fn persist(path: &std::path::Path, data: &[u8]) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await?;
    Ok(())
}
