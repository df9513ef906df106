//! Remote listing, filtering and cache diff (stage L2).

use std::sync::Arc;
use std::time::Duration;

use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::FileCache;
use crate::config::Configuration;
use crate::error::SyncError;
use crate::file::{FileEntry, Layout};
use crate::pool::EntryPool;
use crate::remote::{ObjectPage, ObjectStore, RemoteObject};
use crate::utils::{canonical_name, has_valid_extension, has_valid_name, has_valid_size};
use crate::workset::WorkSet;

/// Retry budget for one listing page. Only a timed-out attempt retries;
/// any other remote error surfaces immediately.
#[derive(Debug, Clone)]
pub struct PageRetry {
    pub attempts: usize,
    pub backoff: Duration,
    pub per_attempt: Duration,
}

impl Default for PageRetry {
    fn default() -> Self {
        PageRetry {
            attempts: 3,
            backoff: Duration::from_secs(1),
            per_attempt: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    More,
    Done,
    Capped,
}

/// Paginates the bucket, diffs each object against the cache and feeds the
/// survivors to the download queue.
///
/// Objects already mirrored (same canonical name, ETag and size) are skipped
/// and their cache entries removed, so the cache shrinks monotonically and
/// whatever remains afterwards exists only locally. The sender is dropped on
/// return, which closes the download queue.
pub async fn list_and_diff(
    store: Arc<dyn ObjectStore>,
    cfg: &Configuration,
    layout: &Layout,
    cache: &FileCache,
    work: &WorkSet,
    entries: &EntryPool,
    downloads: async_channel::Sender<FileEntry>,
    retry: PageRetry,
    token: CancellationToken,
) -> Result<(), SyncError> {
    let chunk_size = cfg.chunk_size();
    let extensions = cfg.extension_list();
    let (min_size, max_size) = cfg.size_bounds();
    let max_pages = cfg.pagination.max_pages;

    let mut state = PageState::More;
    let mut continuation: Option<String> = None;
    let mut pages = 0u32;
    let mut matched = 0u32;

    while state == PageState::More {
        let page = fetch_page(&*store, cfg.max_keys(), continuation.as_deref(), &retry, &token)
            .await?;
        pages += 1;
        debug!("page {pages}: {} object(s)", page.objects.len());

        for object in &page.objects {
            let name = canonical_name(&object.key);
            if !has_valid_extension(&name, &extensions)
                || !has_valid_name(&name, &cfg.name_mask)
                || !has_valid_size(object.size, min_size, max_size)
            {
                continue;
            }
            let etag = object.etag.trim_matches('"');
            if cache.has(&name, etag, object.size) {
                cache.remove(&name);
                matched += 1;
                continue;
            }
            let entry = build_entry(entries, object, chunk_size, layout);
            if entry.is_archive() && layout.decompress {
                work.note_archive();
            }
            work.add_expected(&entry);
            if downloads.send(entry).await.is_err() {
                return Err(SyncError::Cancelled);
            }
        }

        state = next_state(&page, &mut continuation, pages, max_pages);
    }

    info!(
        "listing finished: {} page(s), {} to download, {} already mirrored",
        pages,
        work.count(),
        matched
    );
    Ok(())
}

fn build_entry(
    entries: &EntryPool,
    object: &RemoteObject,
    chunk_size: i64,
    layout: &Layout,
) -> FileEntry {
    let mut entry = entries.acquire();
    entry.assign(&object.key, object.size, &object.etag, layout);
    entry.is_small = object.size <= chunk_size;
    entry
}

fn next_state(
    page: &ObjectPage,
    continuation: &mut Option<String>,
    pages: u32,
    max_pages: u32,
) -> PageState {
    match &page.next_token {
        None => PageState::Done,
        // A repeated continuation token would loop forever.
        Some(next) if continuation.as_ref() == Some(next) => PageState::Done,
        Some(_) if max_pages > 0 && pages >= max_pages => PageState::Capped,
        Some(next) => {
            *continuation = Some(next.clone());
            PageState::More
        }
    }
}

/// One page fetch under the bounded retry policy, honoring cancellation.
async fn fetch_page(
    store: &dyn ObjectStore,
    max_keys: i32,
    continuation: Option<&str>,
    retry: &PageRetry,
    token: &CancellationToken,
) -> Result<ObjectPage, SyncError> {
    let strategy =
        FixedInterval::from_millis(retry.backoff.as_millis() as u64).take(retry.attempts - 1);
    let attempts = retry.attempts;
    let per_attempt = retry.per_attempt;

    let fetch = Retry::spawn(strategy, || async move {
        match tokio::time::timeout(per_attempt, store.list_page(max_keys, continuation)).await {
            Ok(Ok(page)) => Ok(page),
            Ok(Err(err)) => RetryError::to_permanent(err),
            Err(_) => RetryError::to_transient(SyncError::PageRetriesExhausted { attempts }),
        }
    });

    tokio::select! {
        _ = token.cancelled() => Err(SyncError::Cancelled),
        result = fetch => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::remote::fake::{etag_for, MemoryStore};

    const CHUNK: i64 = 1024;

    struct Fixture {
        cfg: Configuration,
        layout: Layout,
        cache: Arc<FileCache>,
        work: Arc<WorkSet>,
        entries: Arc<EntryPool>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut cfg: Configuration = serde_json::from_str("{}").expect("config");
            cfg.pagination.chunk_size_mb = 0;
            Fixture {
                cfg,
                layout: Layout::new("/tmp/mirror"),
                cache: Arc::new(FileCache::new()),
                work: Arc::new(WorkSet::new()),
                entries: Arc::new(EntryPool::new(Arc::new(BufferPool::new()))),
            }
        }

        async fn run(&self, store: MemoryStore) -> Result<Vec<FileEntry>, SyncError> {
            self.run_with_retry(store, fast_retry()).await
        }

        async fn run_with_retry(
            &self,
            store: MemoryStore,
            retry: PageRetry,
        ) -> Result<Vec<FileEntry>, SyncError> {
            let (tx, rx) = async_channel::bounded(4096);
            let result = list_and_diff(
                Arc::new(store),
                &self.cfg,
                &self.layout,
                &self.cache,
                &self.work,
                &self.entries,
                tx,
                retry,
                CancellationToken::new(),
            )
            .await;
            let mut queued = Vec::new();
            while let Ok(entry) = rx.try_recv() {
                queued.push(entry);
            }
            result.map(|_| queued)
        }
    }

    fn fast_retry() -> PageRetry {
        PageRetry {
            attempts: 3,
            backoff: Duration::from_millis(10),
            per_attempt: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn queues_every_unmirrored_object() {
        let mut store = MemoryStore::new();
        store.insert("a.csv", vec![1; 10], CHUNK as usize);
        store.insert("dir/b.csv", vec![2; 2000], CHUNK as usize);
        let fx = Fixture::new();

        let queued = fx.run(store).await.expect("list");
        assert_eq!(queued.len(), 2);
        assert_eq!(fx.work.count(), 2);
        assert_eq!(fx.work.total_bytes(), 2010);
        let small = queued.iter().find(|e| e.key == "a.csv").expect("a.csv");
        assert!(small.is_small);
        assert!(!small.etag.contains('"'));
    }

    #[tokio::test]
    async fn small_classification_follows_chunk_size() {
        let mut fx = Fixture::new();
        fx.cfg.pagination.chunk_size_mb = 1;
        let mut store = MemoryStore::new();
        store.insert("small.bin", vec![0; 1 << 20], 8 << 20);
        store.insert("large.bin", vec![0; (1 << 20) + 1], 8 << 20);

        let queued = fx.run(store).await.expect("list");
        let small = queued.iter().find(|e| e.key == "small.bin").expect("small");
        let large = queued.iter().find(|e| e.key == "large.bin").expect("large");
        assert!(small.is_small);
        assert!(!large.is_small);
    }

    #[tokio::test]
    async fn filters_drop_non_matching_objects() {
        let mut fx = Fixture::new();
        fx.cfg.extensions = "csv".into();
        fx.cfg.name_mask = "2024".into();
        fx.cfg.min_file_size_mb = 0;
        fx.cfg.max_file_size_mb = 1;
        let mut store = MemoryStore::new();
        store.insert("r-2024.csv", vec![1; 100], CHUNK as usize);
        store.insert("r-2024.bin", vec![1; 100], CHUNK as usize);
        store.insert("r-2023.csv", vec![1; 100], CHUNK as usize);
        store.insert("huge-2024.csv", vec![1; 2 << 20], CHUNK as usize);

        let queued = fx.run(store).await.expect("list");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].key, "r-2024.csv");
    }

    #[tokio::test]
    async fn diff_skips_mirrored_objects_and_shrinks_the_cache() {
        let fx = Fixture::new();
        let mut store = MemoryStore::new();
        for i in 0..1000 {
            let body = vec![(i % 251) as u8; 64];
            store.insert(&format!("obj-{i:04}.bin"), body.clone(), CHUNK as usize);
            if i < 500 {
                let etag = etag_for(&body, CHUNK as usize);
                fx.cache.add(
                    format!("obj-{i:04}.bin"),
                    etag.trim_matches('"').to_string(),
                    body.len() as i64,
                );
            }
        }
        assert_eq!(fx.cache.count(), 500);

        let queued = fx.run(store).await.expect("list");
        assert_eq!(queued.len(), 500);
        assert!(queued.iter().all(|e| {
            let n: usize = e.key[4..8].parse().expect("index");
            n >= 500
        }));
        assert_eq!(fx.cache.count(), 0, "matched entries are consumed");
        assert_eq!(fx.work.count(), 500);
    }

    #[tokio::test]
    async fn changed_etag_is_downloaded_again() {
        let fx = Fixture::new();
        let mut store = MemoryStore::new();
        store.insert("same.bin", vec![1; 10], CHUNK as usize);
        store.insert("changed.bin", vec![2; 10], CHUNK as usize);
        let same = etag_for(&vec![1; 10], CHUNK as usize);
        fx.cache
            .add("same.bin".into(), same.trim_matches('"').into(), 10);
        fx.cache.add("changed.bin".into(), "stale".into(), 10);

        let queued = fx.run(store).await.expect("list");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].key, "changed.bin");
        // Only the matched entry left the cache.
        assert_eq!(fx.cache.count(), 1);
    }

    #[tokio::test]
    async fn empty_bucket_leaves_the_cache_alone() {
        let fx = Fixture::new();
        fx.cache.add("leftover.bin".into(), "etag".into(), 3);
        let queued = fx.run(MemoryStore::new()).await.expect("list");
        assert!(queued.is_empty());
        assert_eq!(fx.work.count(), 0);
        assert_eq!(fx.cache.count(), 1);
    }

    #[tokio::test]
    async fn page_cap_stops_the_listing() {
        let mut fx = Fixture::new();
        fx.cfg.pagination.max_keys = 10;
        fx.cfg.pagination.max_pages = 2;
        let mut store = MemoryStore::new();
        for i in 0..100 {
            store.insert(&format!("k{i:03}.bin"), vec![1; 4], CHUNK as usize);
        }

        let queued = fx.run(store).await.expect("list");
        assert_eq!(queued.len(), 20, "two pages of ten keys");
    }

    #[tokio::test]
    async fn duplicate_continuation_token_terminates() {
        let mut fx = Fixture::new();
        fx.cfg.pagination.max_keys = 10;
        let mut store = MemoryStore::new();
        store.repeat_token = true;
        for i in 0..100 {
            store.insert(&format!("k{i:03}.bin"), vec![1; 4], CHUNK as usize);
        }

        // Page two repeats page one's token; the listing must still end.
        let queued = fx.run(store).await.expect("list");
        assert_eq!(queued.len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_page_is_retried_then_succeeds() {
        let fx = Fixture::new();
        let mut store = MemoryStore::new();
        store.insert("a.bin", vec![1; 4], CHUNK as usize);
        store.slow_pages.store(1, std::sync::atomic::Ordering::SeqCst);

        let queued = fx.run(store).await.expect("list");
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_page_retries_are_fatal() {
        let fx = Fixture::new();
        let mut store = MemoryStore::new();
        store.insert("a.bin", vec![1; 4], CHUNK as usize);
        store.slow_pages.store(10, std::sync::atomic::Ordering::SeqCst);

        let err = fx.run(store).await.unwrap_err();
        assert!(matches!(err, SyncError::PageRetriesExhausted { attempts: 3 }));
    }

    #[tokio::test]
    async fn non_timeout_errors_surface_immediately() {
        let fx = Fixture::new();
        let mut store = MemoryStore::new();
        store.fail_listing = true;

        let err = fx.run(store).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)));
    }
}
