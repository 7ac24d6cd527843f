use std::sync::Arc;

use tokio::sync::mpsc;

use super::source::{FetchError, PageSource};
use super::state_store::FeedStateStore;
use crate::config::Config;
use crate::model::{FeedKey, FeedState, FilterSet, Item};
use crate::prefetch::ImagePrefetchScheduler;
use crate::storage::SessionStorage;
use crate::viewport::{
    ControllerOptions, LoadStatus, ScrollOptions, ScrollPositionStore, Viewport,
    ViewportLoadController,
};

/// Capacity of the view event channel. Load-more requests beyond this are
/// dropped; the controller would suppress them anyway while a load runs.
const EVENT_CHANNEL_CAPACITY: usize = 8;

/// Events raised by the mounted view and handled by [`FeedSession::handle_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    LoadMore,
}

/// Result of a load request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A page was fetched; `new_items` survived de-duplication.
    Loaded { new_items: usize },
    /// Nothing to do: already loaded, exhausted, or a load is running.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub page_size: u32,
    pub controller: ControllerOptions,
    pub scroll: ScrollOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            page_size: config.page_size.max(1),
            controller: ControllerOptions::from(&config.viewport),
            scroll: ScrollOptions::from(&config.scroll),
        }
    }
}

struct MountedView {
    controller: ViewportLoadController,
    scroll: ScrollPositionStore,
}

/// The feed view: owns the active filters and drives loading.
///
/// Reads and writes feed data only through the [`FeedStateStore`], so the
/// state survives the session and is shared with any other session on the
/// same store. While mounted, the viewport controller's load-more requests
/// arrive as [`FeedEvent`]s; the owner pulls them with
/// [`next_event`](Self::next_event) and passes them to
/// [`handle_event`](Self::handle_event).
pub struct FeedSession {
    store: FeedStateStore,
    source: Arc<dyn PageSource>,
    storage: Arc<dyn SessionStorage>,
    prefetcher: Option<ImagePrefetchScheduler>,
    options: SessionOptions,
    filters: FilterSet,
    feed_key: FeedKey,
    loading: bool,
    events_tx: mpsc::Sender<FeedEvent>,
    events_rx: mpsc::Receiver<FeedEvent>,
    view: Option<MountedView>,
}

impl FeedSession {
    pub fn new(
        store: FeedStateStore,
        source: Arc<dyn PageSource>,
        storage: Arc<dyn SessionStorage>,
        options: SessionOptions,
        filters: FilterSet,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let feed_key = filters.feed_key();
        Self {
            store,
            source,
            storage,
            prefetcher: None,
            options,
            filters,
            feed_key,
            loading: false,
            events_tx,
            events_rx,
            view: None,
        }
    }

    /// Hand image URLs of newly loaded items to `prefetcher`.
    pub fn with_prefetcher(mut self, prefetcher: ImagePrefetchScheduler) -> Self {
        self.prefetcher = Some(prefetcher);
        self
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    pub fn feed_key(&self) -> &FeedKey {
        &self.feed_key
    }

    pub fn state(&self) -> FeedState {
        self.store.get_state(&self.feed_key)
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_mounted(&self) -> bool {
        self.view.is_some()
    }

    /// Fetch page 1 unless the feed already holds data for these filters.
    pub async fn ensure_loaded(&mut self) -> Result<LoadOutcome, FetchError> {
        self.store.set_filters(&self.feed_key, self.filters.clone());
        if self.state().is_initialized {
            tracing::debug!(feed = %self.feed_key, "Feed already loaded, reusing cached items");
            return Ok(LoadOutcome::Skipped);
        }
        self.load_first_page().await
    }

    /// Refetch page 1 and replace the item list.
    pub async fn refresh(&mut self) -> Result<LoadOutcome, FetchError> {
        if self.loading {
            return Ok(LoadOutcome::Skipped);
        }
        self.store.set_filters(&self.feed_key, self.filters.clone());
        self.load_first_page().await
    }

    async fn load_first_page(&mut self) -> Result<LoadOutcome, FetchError> {
        self.begin_load();
        let result = self
            .source
            .fetch_page(&self.filters, 1, self.options.page_size)
            .await;
        let outcome = match result {
            Ok(page) => {
                self.store.set_items(&self.feed_key, page.items);
                self.store.set_has_more(&self.feed_key, page.has_more);
                let items = self.state().items;
                tracing::info!(
                    feed = %self.feed_key,
                    items = items.len(),
                    has_more = page.has_more,
                    "Loaded first page"
                );
                let new_items = items.len();
                self.prefetch(&items);
                Ok(LoadOutcome::Loaded { new_items })
            }
            Err(e) => Err(self.record_failure(1, e)),
        };
        self.end_load();
        outcome
    }

    /// Fetch the page after the current cursor and append it.
    ///
    /// Skipped while a load runs or once the feed is exhausted. Failures are
    /// recorded on the feed and returned; nothing is retried.
    pub async fn load_more(&mut self) -> Result<LoadOutcome, FetchError> {
        let state = self.state();
        if self.loading || !state.has_more || !state.is_initialized {
            tracing::trace!(
                feed = %self.feed_key,
                loading = self.loading,
                has_more = state.has_more,
                "Load-more skipped"
            );
            return Ok(LoadOutcome::Skipped);
        }

        let page = state.current_page + 1;
        self.begin_load();
        let result = self
            .source
            .fetch_page(&self.filters, page, self.options.page_size)
            .await;
        let outcome = match result {
            Ok(fetched) => {
                let inserted = self.store.append_items(&self.feed_key, fetched.items);
                self.store.set_page(&self.feed_key, page);
                self.store.set_has_more(&self.feed_key, fetched.has_more);
                tracing::info!(
                    feed = %self.feed_key,
                    page = page,
                    new_items = inserted.len(),
                    has_more = fetched.has_more,
                    "Loaded next page"
                );
                self.prefetch(&inserted);
                Ok(LoadOutcome::Loaded {
                    new_items: inserted.len(),
                })
            }
            Err(e) => Err(self.record_failure(page, e)),
        };
        self.end_load();
        outcome
    }

    /// Switch to another filter set.
    ///
    /// The new feed is fetched only if it holds no data yet; a feed visited
    /// earlier is served from the store. The old page's scroll offset is
    /// saved and the new one restored.
    pub async fn change_filters(&mut self, filters: FilterSet) -> Result<LoadOutcome, FetchError> {
        if filters == self.filters {
            return Ok(LoadOutcome::Skipped);
        }
        if let Some(view) = &self.view {
            view.scroll.on_page_hide(self.feed_key.as_str());
        }

        tracing::debug!(from = %self.feed_key, to = %filters.feed_key(), "Filters changed");
        self.feed_key = filters.feed_key();
        self.filters = filters;

        let outcome = self.ensure_loaded().await;
        self.push_status();
        if let Some(view) = &self.view {
            view.scroll.restore(self.feed_key.as_str()).await;
        }
        outcome
    }

    /// Attach a viewport: restore the saved scroll offset, then start the
    /// load-more controller.
    ///
    /// Mounting an already mounted session remounts it.
    pub async fn mount(&mut self, viewport: Arc<dyn Viewport>) {
        if self.view.is_some() {
            self.unmount();
        }

        let tx = self.events_tx.clone();
        let controller = ViewportLoadController::new(
            viewport.clone(),
            self.options.controller.clone(),
            Arc::new(move || {
                if let Err(e) = tx.try_send(FeedEvent::LoadMore) {
                    tracing::trace!(error = %e, "Dropped load-more request");
                }
            }),
        );
        let scroll =
            ScrollPositionStore::new(self.storage.clone(), viewport, self.options.scroll.clone());

        scroll.restore(self.feed_key.as_str()).await;
        controller.mount(self.load_status());
        self.view = Some(MountedView { controller, scroll });
        tracing::debug!(feed = %self.feed_key, "Feed view mounted");
    }

    /// Save the scroll offset, stop the controller and flush the store.
    pub fn unmount(&mut self) {
        if let Some(view) = self.view.take() {
            view.scroll.on_page_hide(self.feed_key.as_str());
            view.controller.teardown();
            self.store.flush();
            tracing::debug!(feed = %self.feed_key, "Feed view unmounted");
        }
    }

    /// Scroll event from the viewport.
    pub fn on_scroll(&self) {
        if let Some(view) = &self.view {
            view.scroll.on_scroll(self.feed_key.as_str());
            view.controller.on_scroll();
        }
    }

    /// Visibility of the end-of-list sentinel changed.
    pub fn on_intersection(&self, is_intersecting: bool) {
        if let Some(view) = &self.view {
            view.controller.on_intersection(is_intersecting);
        }
    }

    /// Run debounced work that has come due.
    pub fn tick(&self) {
        if let Some(view) = &self.view {
            view.scroll.tick();
        }
    }

    /// Wait for the next view event.
    pub async fn next_event(&mut self) -> Option<FeedEvent> {
        self.events_rx.recv().await
    }

    /// Take an already queued view event without waiting.
    pub fn try_next_event(&mut self) -> Option<FeedEvent> {
        self.events_rx.try_recv().ok()
    }

    pub async fn handle_event(&mut self, event: FeedEvent) -> Result<LoadOutcome, FetchError> {
        match event {
            FeedEvent::LoadMore => self.load_more().await,
        }
    }

    fn begin_load(&mut self) {
        self.loading = true;
        self.push_status();
    }

    fn end_load(&mut self) {
        self.loading = false;
        self.push_status();
    }

    fn load_status(&self) -> LoadStatus {
        let state = self.state();
        LoadStatus {
            has_more: state.has_more,
            loading: self.loading,
            item_count: state.items.len(),
        }
    }

    fn push_status(&self) {
        if let Some(view) = &self.view {
            view.controller.set_status(self.load_status());
        }
    }

    fn record_failure(&self, page: u32, error: FetchError) -> FetchError {
        tracing::warn!(feed = %self.feed_key, page = page, error = %error, "Feed page load failed");
        self.store.set_error(&self.feed_key, error.to_string());
        error
    }

    fn prefetch(&self, items: &[Item]) {
        let Some(prefetcher) = &self.prefetcher else {
            return;
        };
        if items.is_empty() {
            return;
        }
        let urls: Vec<String> = items.iter().map(|i| i.image_url.clone()).collect();
        let prefetcher = prefetcher.clone();
        tokio::spawn(async move {
            prefetcher.preload_many(urls).await;
        });
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        self.unmount();
    }
}
