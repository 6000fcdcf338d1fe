//! Paging historical records from a backend into the store.
//!
//! Every pass starts at the durable watermark, so a pass that fails midway
//! can always be repeated. Records overlapping the watermark are fetched
//! again and deduplicated by their natural key.

use async_trait::async_trait;
use log::*;
use tonic::Status;
use triggered::Listener;

use crate::backend::{Page, PageRequest};
use crate::limiter::AdmissionLimiter;
use crate::store;

/// Largest page a backend is asked for.
pub const MAX_PAGE_SIZE: u32 = 50_000;

/// A paged history of one record category.
#[async_trait]
pub trait HistorySource: Send + Sync {
    type Record: Send + Sync + 'static;

    fn name(&self) -> &str;

    /// The durable watermark, `None` if nothing was stored yet.
    async fn watermark(&self) -> Result<Option<u64>, store::Error>;

    /// The inclusive start of the first page for a watermark.
    fn start_from(&self, watermark: Option<u64>) -> u64;

    async fn fetch_page(&self, request: PageRequest) -> Result<Page<Self::Record>, Status>;

    /// Atomically store a page, returning the number of new records.
    async fn store_page(&self, records: &[Self::Record]) -> Result<usize, store::Error>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub pages: usize,
    pub fetched: usize,
    pub stored: usize,
    pub cancelled: bool,
}

/// Page sizes outside `1..=max` fall back to `max`.
pub fn clamp_page_size(page_size: u32, max: u32) -> u32 {
    if page_size == 0 || page_size > max {
        max
    } else {
        page_size
    }
}

/// One pass from the watermark up to the first short page.
///
/// Each fetch is admitted by the limiter. A failed fetch is retried with
/// the same request. A failed store ends the pass with the error.
pub async fn page_forward<S: HistorySource + ?Sized>(
    source: &S,
    page_size: u32,
    limiter: &mut AdmissionLimiter,
    shutdown_signal: &Listener,
) -> Result<Progress, store::Error> {
    let watermark = source.watermark().await?;
    let start = source.start_from(watermark);
    let mut request = PageRequest { start, index_offset: 0, max_records: page_size };
    let mut progress = Progress::default();
    debug!("{}: paging from {:?}", source.name(), watermark);
    loop {
        if !limiter.admit(shutdown_signal).await {
            progress.cancelled = true;
            return Ok(progress);
        }
        let result = tokio::select! {
            biased;
            _ = shutdown_signal.clone() => {
                progress.cancelled = true;
                return Ok(progress);
            }
            result = source.fetch_page(request) => result,
        };
        let page = match result {
            Ok(page) => page,
            Err(status) => {
                error!("{}: fetching {:?} failed: {}", source.name(), request, status);
                continue;
            }
        };
        let count = page.records.len();
        progress.pages += 1;
        progress.fetched += count;
        if count > 0 {
            progress.stored += source.store_page(&page.records).await?;
        }
        if count < request.max_records as usize {
            return Ok(progress);
        }
        if page.last_index_offset <= request.index_offset {
            warn!(
                "{}: page offset did not advance past {}, stopping",
                source.name(),
                request.index_offset
            );
            return Ok(progress);
        }
        request.index_offset = page.last_index_offset;
    }
}

/// Catch up with the backend's history before live streaming.
///
/// A store failure restarts paging from the durable watermark, paced by the
/// limiter, until a pass completes or shutdown is signalled.
pub async fn backfill<S: HistorySource + ?Sized>(
    source: &S,
    page_size: u32,
    limiter: &mut AdmissionLimiter,
    shutdown_signal: &Listener,
) -> Progress {
    info!("{}: backfill started", source.name());
    loop {
        match page_forward(source, page_size, limiter, shutdown_signal).await {
            Ok(progress) => {
                info!(
                    "{}: backfill {} after {} pages, {} of {} records new",
                    source.name(),
                    if progress.cancelled { "cancelled" } else { "complete" },
                    progress.pages,
                    progress.stored,
                    progress.fetched
                );
                return progress;
            }
            Err(e) => {
                error!("{}: backfill failed, resuming from watermark: {}", source.name(), e);
                if !limiter.admit(shutdown_signal).await {
                    return Progress { cancelled: true, ..Default::default() };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use test_log::test;

    // Records are plain numbers, the watermark is the largest stored one.
    struct Numbers {
        history: Vec<u64>,
        stored: Mutex<BTreeMap<u64, ()>>,
        requests: Mutex<Vec<PageRequest>>,
        fetch_failures: Mutex<usize>,
        store_failures: Mutex<usize>,
    }

    impl Numbers {
        fn new(history: Vec<u64>) -> Self {
            Numbers {
                history,
                stored: Mutex::new(BTreeMap::new()),
                requests: Mutex::new(Vec::new()),
                fetch_failures: Mutex::new(0),
                store_failures: Mutex::new(0),
            }
        }

        fn stored(&self) -> Vec<u64> {
            self.stored.lock().unwrap().keys().copied().collect()
        }
    }

    #[async_trait]
    impl HistorySource for Numbers {
        type Record = u64;

        fn name(&self) -> &str {
            "numbers"
        }

        async fn watermark(&self) -> Result<Option<u64>, store::Error> {
            Ok(self.stored.lock().unwrap().keys().next_back().copied())
        }

        fn start_from(&self, watermark: Option<u64>) -> u64 {
            watermark.unwrap_or(0)
        }

        async fn fetch_page(&self, request: PageRequest) -> Result<Page<u64>, Status> {
            self.requests.lock().unwrap().push(request);
            let mut failures = self.fetch_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Status::unavailable("backend down"));
            }
            let records: Vec<u64> = self
                .history
                .iter()
                .filter(|n| **n >= request.start)
                .skip(request.index_offset as usize)
                .take(request.max_records as usize)
                .copied()
                .collect();
            let last_index_offset = request.index_offset + records.len() as u32;
            Ok(Page { records, last_index_offset })
        }

        async fn store_page(&self, records: &[u64]) -> Result<usize, store::Error> {
            let mut failures = self.store_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(store::Error::Unavailable("database down".to_string()));
            }
            let mut stored = self.stored.lock().unwrap();
            Ok(records.iter().filter(|n| stored.insert(**n, ()).is_none()).count())
        }
    }

    fn limiter() -> AdmissionLimiter {
        AdmissionLimiter::new(Duration::from_secs(1))
    }

    #[test]
    fn clamp_page_size_test() {
        assert_eq!(clamp_page_size(0, MAX_PAGE_SIZE), MAX_PAGE_SIZE);
        assert_eq!(clamp_page_size(100, MAX_PAGE_SIZE), 100);
        assert_eq!(clamp_page_size(MAX_PAGE_SIZE + 1, MAX_PAGE_SIZE), MAX_PAGE_SIZE);
    }

    #[test(tokio::test(start_paused = true))]
    async fn stops_on_short_page_test() {
        let source = Numbers::new((1..=25).collect());
        let (_trigger, listener) = triggered::trigger();
        let progress = backfill(&source, 10, &mut limiter(), &listener).await;
        assert_eq!(progress, Progress { pages: 3, fetched: 25, stored: 25, cancelled: false });
        let requests = source.requests.lock().unwrap().clone();
        let offsets: Vec<u32> = requests.iter().map(|r| r.index_offset).collect();
        assert_eq!(offsets, vec![0, 10, 20]);
        assert!(requests.iter().all(|r| r.start == 0 && r.max_records == 10));
    }

    #[test(tokio::test(start_paused = true))]
    async fn full_last_page_needs_empty_page_test() {
        let source = Numbers::new((1..=20).collect());
        let (_trigger, listener) = triggered::trigger();
        let progress = backfill(&source, 10, &mut limiter(), &listener).await;
        assert_eq!(progress.pages, 3);
        assert_eq!(progress.stored, 20);
    }

    #[test(tokio::test(start_paused = true))]
    async fn resumes_from_watermark_test() {
        let source = Numbers::new((1..=30).collect());
        source.stored.lock().unwrap().extend((1..=12).map(|n| (n, ())));
        let (_trigger, listener) = triggered::trigger();
        let progress = backfill(&source, 50, &mut limiter(), &listener).await;
        // the watermark record itself is fetched again and deduplicated
        assert_eq!(progress, Progress { pages: 1, fetched: 19, stored: 18, cancelled: false });
        assert_eq!(source.requests.lock().unwrap()[0].start, 12);
        assert_eq!(source.stored(), (1..=30).collect::<Vec<_>>());
    }

    #[test(tokio::test(start_paused = true))]
    async fn fetch_failure_retries_same_page_test() {
        let source = Numbers::new((1..=15).collect());
        *source.fetch_failures.lock().unwrap() = 2;
        let (_trigger, listener) = triggered::trigger();
        let progress = backfill(&source, 10, &mut limiter(), &listener).await;
        assert_eq!(progress.stored, 15);
        let offsets: Vec<u32> =
            source.requests.lock().unwrap().iter().map(|r| r.index_offset).collect();
        assert_eq!(offsets, vec![0, 0, 0, 10]);
    }

    #[test(tokio::test(start_paused = true))]
    async fn store_failure_restarts_from_watermark_test() {
        let source = Numbers::new((1..=15).collect());
        *source.store_failures.lock().unwrap() = 1;
        let (_trigger, listener) = triggered::trigger();
        let progress = backfill(&source, 10, &mut limiter(), &listener).await;
        assert!(!progress.cancelled);
        assert_eq!(source.stored(), (1..=15).collect::<Vec<_>>());
        let offsets: Vec<u32> =
            source.requests.lock().unwrap().iter().map(|r| r.index_offset).collect();
        assert_eq!(offsets, vec![0, 0, 10]);
    }

    #[test(tokio::test(start_paused = true))]
    async fn cancelled_backfill_test() {
        let source = Numbers::new((1..=100).collect());
        *source.fetch_failures.lock().unwrap() = usize::MAX;
        let (trigger, listener) = triggered::trigger();
        let task = tokio::spawn(async move {
            let progress = backfill(&source, 10, &mut limiter(), &listener).await;
            (progress, source.stored())
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.trigger();
        let (progress, stored) = task.await.unwrap();
        assert!(progress.cancelled);
        assert!(stored.is_empty());
    }
}
