//! Positional writers with byte-progress accounting.
//!
//! The object-store part workers produce non-overlapping positional writes.
//! Both sinks accept them through one seam: a pre-extended in-memory arena
//! for bodies held in memory, and the destination file itself for the
//! direct-to-disk path.

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Accepts non-overlapping writes at absolute offsets.
pub trait WriteAt: Send + Sync {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
}

/// In-memory arena extended to the object size up front, so concurrent part
/// writes land in disjoint regions and never reallocate under each other.
pub struct SharedBuffer {
    inner: Mutex<Vec<u8>>,
}

impl SharedBuffer {
    /// Wraps a pooled buffer, zero-extending it to `size`.
    pub fn new(mut buffer: Vec<u8>, size: usize) -> Self {
        buffer.clear();
        buffer.resize(size, 0);
        SharedBuffer {
            inner: Mutex::new(buffer),
        }
    }

    /// Recovers the filled buffer for the entry that owns it.
    pub fn into_inner(self) -> Vec<u8> {
        self.inner.into_inner().expect("shared buffer poisoned")
    }
}

impl WriteAt for SharedBuffer {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut data = self.inner.lock().expect("shared buffer poisoned");
        let start = offset as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

impl WriteAt for File {
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(self, buf, offset)
    }
}

/// Wraps a positional sink and adds each successful write to a shared byte
/// counter, keeping its own monotonic per-item total on the side.
pub struct ProgressWriter<W: WriteAt> {
    inner: W,
    written: AtomicU64,
    counter: Arc<AtomicU64>,
}

impl<W: WriteAt> ProgressWriter<W> {
    pub fn new(inner: W, counter: Arc<AtomicU64>) -> Self {
        ProgressWriter {
            inner,
            written: AtomicU64::new(0),
            counter,
        }
    }

    /// Bytes successfully written through this writer so far.
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    /// Unwraps into the sink and the final written total.
    pub fn into_parts(self) -> (W, u64) {
        let written = self.written.load(Ordering::Acquire);
        (self.inner, written)
    }
}

impl<W: WriteAt> WriteAt for ProgressWriter<W> {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let n = self.inner.write_at(buf, offset)?;
        self.written.fetch_add(n as u64, Ordering::AcqRel);
        self.counter.fetch_add(n as u64, Ordering::AcqRel);
        Ok(n)
    }
}
