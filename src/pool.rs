//! Object pools and the worker-pool primitive shared by every stage.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::file::FileEntry;

/// Buffers above this capacity are shrunk on release.
const SHRINK_CAPACITY: usize = 16 << 20;

/// Shared pool of growable byte buffers for small-file and archive bodies.
///
/// Acquire hands out an empty buffer; release clears it and trims oversized
/// capacity. Move semantics guarantee a buffer is never held by two owners.
#[derive(Default)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_default()
    }

    pub fn release(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        if buffer.capacity() > SHRINK_CAPACITY {
            buffer.shrink_to(SHRINK_CAPACITY);
        }
        self.buffers
            .lock()
            .expect("buffer pool poisoned")
            .push(buffer);
    }

    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.buffers.lock().expect("buffer pool poisoned").len()
    }
}

/// Pool of [`FileEntry`] values. Release resets every field and returns any
/// held body to the buffer pool, so terminal sinks only ever call one method.
pub struct EntryPool {
    entries: Mutex<Vec<FileEntry>>,
    buffers: Arc<BufferPool>,
}

impl EntryPool {
    pub fn new(buffers: Arc<BufferPool>) -> Self {
        EntryPool {
            entries: Mutex::new(Vec::new()),
            buffers,
        }
    }

    pub fn acquire(&self) -> FileEntry {
        self.entries
            .lock()
            .expect("entry pool poisoned")
            .pop()
            .unwrap_or_default()
    }

    pub fn release(&self, mut entry: FileEntry) {
        if let Some(buffer) = entry.reset() {
            self.buffers.release(buffer);
        }
        self.entries
            .lock()
            .expect("entry pool poisoned")
            .push(entry);
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }
}

/// N workers draining a bounded queue, with an explicit close-and-wait.
///
/// The queue is the sole admission mechanism: workers block on an empty
/// queue and exit when it closes or the run token is cancelled.
pub struct WorkerPool<T> {
    tx: async_channel::Sender<T>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawns `size` workers over a queue of `capacity` slots.
    pub fn spawn<F, Fut>(
        size: usize,
        capacity: usize,
        token: CancellationToken,
        handler: F,
    ) -> Self
    where
        F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        let workers = (0..size.max(1))
            .map(|_| {
                let rx = rx.clone();
                let handler = handler.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            item = rx.recv() => match item {
                                Ok(item) => handler(item).await,
                                Err(_) => break,
                            },
                        }
                    }
                })
            })
            .collect();
        WorkerPool { tx, workers }
    }

    /// A submit handle for upstream stages. Dropping every clone together
    /// with the pool itself closes the queue.
    pub fn sender(&self) -> async_channel::Sender<T> {
        self.tx.clone()
    }

    /// Queues one item, blocking while the queue is full. Returns false
    /// once the pool has shut down.
    pub async fn submit(&self, item: T) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// Closes the queue and waits for every worker to drain and exit.
    pub async fn close_and_wait(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn buffer_release_clears_and_reuses() {
        let pool = BufferPool::new();
        let mut buffer = pool.acquire();
        buffer.extend_from_slice(b"payload");
        pool.release(buffer);
        assert_eq!(pool.idle(), 1);
        let again = pool.acquire();
        assert!(again.is_empty());
        assert!(again.capacity() >= 7);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn entry_release_returns_the_body_to_the_buffer_pool() {
        let buffers = Arc::new(BufferPool::new());
        let entries = EntryPool::new(buffers.clone());
        let mut entry = entries.acquire();
        entry.key = "a".into();
        entry.body = Some(vec![1, 2, 3]);
        entries.release(entry);
        assert_eq!(buffers.idle(), 1);
        let reused = entries.acquire();
        assert!(reused.key.is_empty() && reused.body.is_none());
    }

    #[tokio::test]
    async fn worker_pool_processes_every_item_exactly_once() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let handler_seen = seen.clone();
        let pool = WorkerPool::spawn(4, 8, CancellationToken::new(), move |n: u32| {
            let seen = handler_seen.clone();
            async move {
                assert!(seen.lock().expect("lock").insert(n), "duplicate delivery");
            }
        });
        for n in 0..100u32 {
            assert!(pool.submit(n).await);
        }
        pool.close_and_wait().await;
        assert_eq!(seen.lock().expect("lock").len(), 100);
    }

    #[tokio::test]
    async fn cancelled_pool_stops_admitting_work() {
        let token = CancellationToken::new();
        let handled = Arc::new(AtomicUsize::new(0));
        let handler_count = handled.clone();
        let pool = WorkerPool::spawn(2, 4, token.clone(), move |_: u32| {
            let count = handler_count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        token.cancel();
        pool.close_and_wait().await;
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn submit_fails_once_workers_are_gone() {
        let token = CancellationToken::new();
        let pool: WorkerPool<u32> = WorkerPool::spawn(1, 1, token.clone(), |_| async {});
        let sender = pool.sender();
        token.cancel();
        pool.close_and_wait().await;
        assert!(sender.send(1).await.is_err());
    }
}
