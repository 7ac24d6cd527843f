use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;

use super::loader::{ImageLoader, PrefetchError};
use crate::config::PrefetchConfig;

#[derive(Debug, Clone)]
pub struct PrefetchOptions {
    /// Per-image load timeout.
    pub timeout: Duration,
    /// Leading URLs of a `preload_many` call loaded immediately.
    pub high_priority: usize,
    /// Background batch size.
    pub batch_size: usize,
    /// Pause after each background batch.
    pub batch_delay: Duration,
}

impl Default for PrefetchOptions {
    fn default() -> Self {
        Self::from(&PrefetchConfig::default())
    }
}

impl From<&PrefetchConfig> for PrefetchOptions {
    fn from(config: &PrefetchConfig) -> Self {
        Self {
            timeout: config.timeout(),
            high_priority: config.high_priority,
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Queued,
    Loading,
    Done,
    Failed,
}

/// Scheduler bookkeeping for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchEntry {
    pub url: String,
    pub priority: Priority,
    pub state: EntryState,
}

/// Successful result of [`ImagePrefetchScheduler::preload_one`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadOutcome {
    /// Fetched now.
    Loaded,
    /// Already completed earlier; nothing was fetched.
    Cached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub cached: usize,
    pub queued: usize,
}

/// Result of the high-priority part of a `preload_many` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreloadSummary {
    pub loaded: usize,
    pub failed: usize,
    pub queued: usize,
}

/// Preloads images referenced by newly loaded feed items.
///
/// Keeps a session-wide set of URLs already loaded (never fetched twice,
/// cleared only by `clear_cache`) and a FIFO queue of low-priority URLs that
/// one background task drains in small batches. Individual failures are
/// logged and otherwise ignored.
///
/// Clones share the same cache and queue.
#[derive(Clone)]
pub struct ImagePrefetchScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    loader: Arc<dyn ImageLoader>,
    options: PrefetchOptions,
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    completed: HashSet<String>,
    queue: VecDeque<PrefetchEntry>,
    entries: HashMap<String, PrefetchEntry>,
    draining: bool,
    /// Bumped by `clear_cache`; loads started under an older generation are ignored.
    generation: u64,
}

impl SchedulerState {
    fn is_loading(&self, url: &str) -> bool {
        matches!(self.entries.get(url), Some(e) if e.state == EntryState::Loading)
    }
}

impl ImagePrefetchScheduler {
    pub fn new(loader: Arc<dyn ImageLoader>, options: PrefetchOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                loader,
                options,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load one image with the default timeout.
    pub async fn preload_one(&self, url: &str) -> Result<PreloadOutcome, PrefetchError> {
        self.preload_with_timeout(url, self.inner.options.timeout, Priority::High)
            .await
    }

    /// Load one image, failing after `timeout`.
    ///
    /// A URL already in the completed set resolves immediately.
    pub async fn preload_with_timeout(
        &self,
        url: &str,
        timeout: Duration,
        priority: Priority,
    ) -> Result<PreloadOutcome, PrefetchError> {
        let generation = {
            let mut state = self.lock();
            if state.completed.contains(url) {
                return Ok(PreloadOutcome::Cached);
            }
            state.entries.insert(
                url.to_string(),
                PrefetchEntry {
                    url: url.to_string(),
                    priority,
                    state: EntryState::Loading,
                },
            );
            state.generation
        };

        let result = match tokio::time::timeout(timeout, self.inner.loader.load(url)).await {
            Ok(Ok(())) => Ok(PreloadOutcome::Loaded),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PrefetchError::Timeout(timeout)),
        };

        let mut state = self.lock();
        if state.generation != generation {
            tracing::trace!(url = %url, "Ignoring image load finished after cache clear");
            return result;
        }
        let entry_state = if result.is_ok() {
            state.completed.insert(url.to_string());
            EntryState::Done
        } else {
            EntryState::Failed
        };
        if let Some(entry) = state.entries.get_mut(url) {
            entry.state = entry_state;
        }
        result
    }

    /// Preload a batch of image URLs.
    ///
    /// The first `high_priority` URLs are loaded together and awaited; a
    /// failure among them never affects the others. The remainder is queued
    /// for the background drain, which starts only if it is not already
    /// running. URLs already loading are left to the load in flight.
    pub async fn preload_many(&self, mut urls: Vec<String>) -> PreloadSummary {
        {
            let state = self.lock();
            urls.retain(|url| !state.is_loading(url));
        }
        let split = self.inner.options.high_priority.min(urls.len());
        let low = urls.split_off(split);
        let high = urls;

        let results = join_all(high.iter().map(|url| self.preload_one(url))).await;
        let mut summary = PreloadSummary::default();
        for (url, result) in high.iter().zip(results) {
            match result {
                Ok(_) => summary.loaded += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::debug!(url = %url, error = %e, "High-priority image preload failed");
                }
            }
        }

        summary.queued = self.enqueue(low);
        if summary.queued > 0 {
            self.start_drain();
        }
        summary
    }

    /// Append URLs to the low-priority queue, skipping completed, loading and
    /// already queued ones. Returns how many were added.
    fn enqueue(&self, urls: Vec<String>) -> usize {
        let mut state = self.lock();
        let mut added = 0;
        for url in urls {
            if state.completed.contains(&url)
                || state.is_loading(&url)
                || state.queue.iter().any(|e| e.url == url)
            {
                continue;
            }
            let entry = PrefetchEntry {
                url: url.clone(),
                priority: Priority::Low,
                state: EntryState::Queued,
            };
            state.entries.insert(url, entry.clone());
            state.queue.push_back(entry);
            added += 1;
        }
        added
    }

    /// Single-flight: a running drain picks up anything enqueued later.
    fn start_drain(&self) {
        {
            let mut state = self.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.drain().await });
    }

    async fn drain(self) {
        let options = self.inner.options.clone();
        loop {
            let batch: Vec<String> = {
                let mut state = self.lock();
                if state.queue.is_empty() {
                    state.draining = false;
                    return;
                }
                let take = options.batch_size.min(state.queue.len());
                state.queue.drain(..take).map(|e| e.url).collect()
            };

            tracing::trace!(batch = batch.len(), "Draining low-priority image batch");
            let results = join_all(batch.iter().map(|url| {
                self.preload_with_timeout(url, options.timeout, Priority::Low)
            }))
            .await;
            for (url, result) in batch.iter().zip(results) {
                if let Err(e) = result {
                    tracing::debug!(url = %url, error = %e, "Background image preload failed");
                }
            }

            tokio::time::sleep(options.batch_delay).await;
        }
    }

    /// True once `url` has loaded successfully at least once.
    pub fn is_preloaded(&self, url: &str) -> bool {
        self.lock().completed.contains(url)
    }

    pub fn entry(&self, url: &str) -> Option<PrefetchEntry> {
        self.lock().entries.get(url).cloned()
    }

    pub fn cache_stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            cached: state.completed.len(),
            queued: state.queue.len(),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.lock().draining
    }

    /// Forget every completed URL and drop the pending queue.
    ///
    /// Loads already in flight are not cancelled; their results are ignored.
    pub fn clear_cache(&self) {
        let mut state = self.lock();
        state.completed.clear();
        state.queue.clear();
        state.entries.clear();
        state.generation += 1;
        tracing::debug!("Image prefetch cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Start(String),
        End(String),
    }

    /// Loader taking a fixed time per image, failing or hanging on chosen URLs.
    struct ScriptedLoader {
        delay: Duration,
        failing: HashSet<String>,
        hanging: HashSet<String>,
        events: Mutex<Vec<(Event, Instant)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedLoader {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                failing: HashSet::new(),
                hanging: HashSet::new(),
                events: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        fn failing(mut self, url: &str) -> Self {
            self.failing.insert(url.to_string());
            self
        }

        fn hanging(mut self, url: &str) -> Self {
            self.hanging.insert(url.to_string());
            self
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().iter().map(|(e, _)| e.clone()).collect()
        }

        fn start_time(&self, url: &str) -> Option<Instant> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .find(|(e, _)| *e == Event::Start(url.to_string()))
                .map(|(_, t)| *t)
        }

        fn starts(&self, url: &str) -> usize {
            self.events()
                .iter()
                .filter(|e| **e == Event::Start(url.to_string()))
                .count()
        }
    }

    #[async_trait]
    impl ImageLoader for ScriptedLoader {
        async fn load(&self, url: &str) -> Result<(), PrefetchError> {
            self.events
                .lock()
                .unwrap()
                .push((Event::Start(url.to_string()), Instant::now()));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if self.hanging.contains(url) {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.delay).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.events
                .lock()
                .unwrap()
                .push((Event::End(url.to_string()), Instant::now()));
            if self.failing.contains(url) {
                Err(PrefetchError::Failed(format!("decode error for {url}")))
            } else {
                Ok(())
            }
        }
    }

    fn urls(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("u{i}")).collect()
    }

    fn scheduler(loader: Arc<ScriptedLoader>) -> ImagePrefetchScheduler {
        ImagePrefetchScheduler::new(loader, PrefetchOptions::default())
    }

    async fn wait_for_drain(scheduler: &ImagePrefetchScheduler) {
        while scheduler.is_draining() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_settles_before_low_starts() {
        let loader = Arc::new(ScriptedLoader::new(Duration::from_millis(50)));
        let scheduler = scheduler(loader.clone());

        let summary = scheduler.preload_many(urls(10)).await;
        assert_eq!(summary.loaded, 3);
        assert_eq!(summary.queued, 7);
        wait_for_drain(&scheduler).await;

        let events = loader.events();
        let first_low_start = events
            .iter()
            .position(|e| *e == Event::Start("u4".into()))
            .unwrap();
        for url in ["u1", "u2", "u3"] {
            let end = events
                .iter()
                .position(|e| *e == Event::End(url.into()))
                .unwrap();
            assert!(end < first_low_start, "{url} ended after u4 started");
        }
        for url in urls(10) {
            assert!(scheduler.is_preloaded(&url));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_failure_does_not_abort_batch() {
        let loader = Arc::new(ScriptedLoader::new(Duration::from_millis(10)).failing("u2"));
        let scheduler = scheduler(loader.clone());

        let summary = scheduler.preload_many(urls(3)).await;
        assert_eq!(summary, PreloadSummary { loaded: 2, failed: 1, queued: 0 });
        assert!(scheduler.is_preloaded("u1"));
        assert!(!scheduler.is_preloaded("u2"));
        assert!(scheduler.is_preloaded("u3"));
        assert_eq!(scheduler.entry("u2").unwrap().state, EntryState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_url_never_reloads() {
        let loader = Arc::new(ScriptedLoader::new(Duration::from_millis(10)));
        let scheduler = scheduler(loader.clone());

        assert!(!scheduler.is_preloaded("u1"));
        assert_eq!(scheduler.preload_one("u1").await.unwrap(), PreloadOutcome::Loaded);
        assert!(scheduler.is_preloaded("u1"));
        assert_eq!(scheduler.preload_one("u1").await.unwrap(), PreloadOutcome::Cached);
        scheduler.preload_many(vec!["u1".into()]).await;
        assert_eq!(loader.starts("u1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_url_may_be_retried() {
        let loader = Arc::new(ScriptedLoader::new(Duration::from_millis(10)).failing("u1"));
        let scheduler = scheduler(loader.clone());

        assert!(scheduler.preload_one("u1").await.is_err());
        assert!(scheduler.preload_one("u1").await.is_err());
        assert_eq!(loader.starts("u1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_and_is_not_cached() {
        let loader = Arc::new(ScriptedLoader::new(Duration::from_millis(10)).hanging("slow"));
        let scheduler = scheduler(loader.clone());

        let result = scheduler
            .preload_with_timeout("slow", Duration::from_millis(500), Priority::High)
            .await;
        assert!(matches!(result, Err(PrefetchError::Timeout(_))));
        assert!(!scheduler.is_preloaded("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_batches_of_three_with_delay() {
        let loader = Arc::new(ScriptedLoader::new(Duration::from_millis(50)));
        let scheduler = scheduler(loader.clone());

        scheduler.preload_many(urls(10)).await;
        wait_for_drain(&scheduler).await;

        let t4 = loader.start_time("u4").unwrap();
        // Batch members start together
        assert_eq!(loader.start_time("u5").unwrap(), t4);
        assert_eq!(loader.start_time("u6").unwrap(), t4);
        // Next batch waits for the previous one (50ms) plus the 100ms pause
        let t7 = loader.start_time("u7").unwrap();
        assert_eq!(t7 - t4, Duration::from_millis(150));
        let t10 = loader.start_time("u10").unwrap();
        assert_eq!(t10 - t7, Duration::from_millis(150));
        assert!(loader.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_while_draining_only_enqueues() {
        let loader = Arc::new(ScriptedLoader::new(Duration::from_millis(50)));
        let scheduler = scheduler(loader.clone());

        scheduler.preload_many(urls(9)).await;
        assert!(scheduler.is_draining());

        let more: Vec<String> = (20..29).map(|i| format!("u{i}")).collect();
        let summary = scheduler.preload_many(more).await;
        assert_eq!(summary.loaded, 3);
        assert!(summary.queued > 0);

        wait_for_drain(&scheduler).await;
        // One drain loop handled both queues
        assert_eq!(loader.starts("u4"), 1);
        assert_eq!(loader.starts("u28"), 1);
        assert_eq!(scheduler.cache_stats(), CacheStats { cached: 18, queued: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_skips_duplicates_and_completed() {
        let loader = Arc::new(ScriptedLoader::new(Duration::from_millis(10)));
        let scheduler = scheduler(loader.clone());
        scheduler.preload_one("u5").await.unwrap();

        let summary = scheduler
            .preload_many(vec![
                "a".into(),
                "b".into(),
                "c".into(),
                "u5".into(),
                "d".into(),
                "d".into(),
            ])
            .await;
        assert_eq!(summary.queued, 1);
        assert_eq!(scheduler.cache_stats().queued, 1);
        assert_eq!(scheduler.entry("d").unwrap().state, EntryState::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_url_is_not_loaded_again() {
        let loader = Arc::new(ScriptedLoader::new(Duration::from_millis(100)));
        let scheduler = scheduler(loader.clone());

        let pending = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.preload_one("u1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.entry("u1").unwrap().state, EntryState::Loading);

        // Once as a high-priority URL, once as a queued one
        scheduler.preload_many(vec!["u1".into()]).await;
        let summary = scheduler
            .preload_many(vec!["a".into(), "b".into(), "c".into(), "u1".into()])
            .await;
        assert_eq!(summary.queued, 0);

        pending.await.unwrap().unwrap();
        wait_for_drain(&scheduler).await;
        assert_eq!(loader.starts("u1"), 1);
        assert!(scheduler.is_preloaded("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cache_ignores_in_flight_results() {
        let loader = Arc::new(ScriptedLoader::new(Duration::from_millis(100)));
        let scheduler = scheduler(loader.clone());

        let pending = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.preload_one("u1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        scheduler.clear_cache();

        assert!(pending.await.unwrap().is_ok());
        assert!(!scheduler.is_preloaded("u1"));
        assert_eq!(scheduler.cache_stats(), CacheStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_batch_is_noop() {
        let loader = Arc::new(ScriptedLoader::new(Duration::from_millis(10)));
        let scheduler = scheduler(loader.clone());
        assert_eq!(scheduler.preload_many(Vec::new()).await, PreloadSummary::default());
        assert!(!scheduler.is_draining());
        assert!(loader.events().is_empty());
    }
}
