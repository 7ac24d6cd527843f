use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use crate::model::{FeedKey, FeedState, FilterSet, Item, ItemId};
use crate::storage::SessionStorage;

/// Storage key holding every cached feed as one JSON document.
pub const FEED_CACHE_KEY: &str = "memefeed.feed-cache";

/// Bumped when the persisted layout changes incompatibly.
const CACHE_VERSION: u32 = 1;

#[derive(Serialize)]
struct PersistedCache<'a> {
    version: u32,
    feeds: &'a BTreeMap<FeedKey, FeedState>,
}

// ============================================================================
// FeedStateStore
// ============================================================================

/// Canonical in-memory feed cache mirrored to session storage.
///
/// One `FeedState` per feed key, and a state's filters always derive its key.
/// The first mutation of an unseen key creates the state from the filters
/// encoded in the key; a key that does not parse is refused. Every mutation schedules a persist; all
/// mutations made before the scheduled task runs share one write. The store
/// never performs network I/O: a feed invalidated by `set_filters` stays
/// uninitialized until the caller fetches and calls `set_items`.
///
/// Cloning is cheap and clones share state, so the store outlives any single
/// view that mounts it.
#[derive(Clone)]
pub struct FeedStateStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    storage: Arc<dyn SessionStorage>,
    persist_debounce: Duration,
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    feeds: BTreeMap<FeedKey, FeedState>,
    persist_pending: bool,
}

impl FeedStateStore {
    /// Create a store and rehydrate it from `storage`.
    ///
    /// `persist_debounce` of zero flushes on the next scheduler tick.
    pub fn new(storage: Arc<dyn SessionStorage>, persist_debounce: Duration) -> Self {
        let feeds = rehydrate(storage.as_ref());
        Self {
            inner: Arc::new(StoreInner {
                storage,
                persist_debounce,
                state: Mutex::new(StoreState {
                    feeds,
                    persist_pending: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // State is plain data; a panic mid-mutation cannot leave it unusable
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state of a feed, or an uninitialized default.
    pub fn get_state(&self, feed_key: &FeedKey) -> FeedState {
        self.lock().feeds.get(feed_key).cloned().unwrap_or_default()
    }

    /// Replace the item list wholesale (first load or explicit refresh).
    ///
    /// Marks the feed initialized, clears any error and rewinds the page
    /// cursor to 1.
    pub fn set_items(&self, feed_key: &FeedKey, items: Vec<Item>) {
        self.mutate(feed_key, |state| {
            let mut seen = HashSet::with_capacity(items.len());
            state.items = items
                .into_iter()
                .filter(|item| seen.insert(item.id.clone()))
                .collect();
            state.current_page = 1;
            state.is_initialized = true;
            state.error = None;
            tracing::debug!(feed = %feed_key, count = state.items.len(), "Feed items replaced");
        });
    }

    /// Append items, skipping ids already present. First occurrence wins.
    ///
    /// Returns the items actually inserted, in order. Appends must arrive in
    /// page order; the store does not resequence.
    pub fn append_items(&self, feed_key: &FeedKey, items: Vec<Item>) -> Vec<Item> {
        self.mutate(feed_key, |state| {
            let mut seen: HashSet<ItemId> = state.items.iter().map(|i| i.id.clone()).collect();
            let offered = items.len();
            let inserted: Vec<Item> = items
                .into_iter()
                .filter(|item| seen.insert(item.id.clone()))
                .collect();
            state.items.extend(inserted.iter().cloned());

            if inserted.len() < offered {
                tracing::debug!(
                    feed = %feed_key,
                    offered = offered,
                    duplicates = offered - inserted.len(),
                    "Skipped duplicate items on append"
                );
            }
            inserted
        })
    }

    pub fn set_has_more(&self, feed_key: &FeedKey, has_more: bool) {
        self.mutate(feed_key, |state| state.has_more = has_more);
    }

    /// Advance the page cursor. Moving backwards is refused; rewinding only
    /// happens through `set_items`.
    ///
    /// Returns whether the cursor changed.
    pub fn set_page(&self, feed_key: &FeedKey, page: u32) -> bool {
        let current = self.get_state(feed_key).current_page;
        if page < current {
            tracing::debug!(
                feed = %feed_key,
                current = current,
                requested = page,
                "Ignoring backwards page cursor"
            );
            return false;
        }
        if page == current {
            return false;
        }
        self.mutate(feed_key, |state| {
            state.current_page = page;
            true
        })
    }

    /// Record the active filters of a feed.
    ///
    /// Differing filters reset the feed to an uninitialized state with no
    /// items, so a caller can never serve data loaded under other filters.
    /// Filters deriving another key are refused. Returns whether the filters
    /// changed.
    pub fn set_filters(&self, feed_key: &FeedKey, filters: FilterSet) -> bool {
        if filters.feed_key() != *feed_key {
            tracing::warn!(
                feed = %feed_key,
                derived = %filters.feed_key(),
                "Refusing filters that belong to another feed key"
            );
            return false;
        }
        {
            let state = self.lock();
            if let Some(existing) = state.feeds.get(feed_key) {
                if existing.filters == filters {
                    return false;
                }
            }
        }
        self.mutate(feed_key, |state| {
            tracing::debug!(feed = %feed_key, "Filters changed, feed invalidated");
            *state = FeedState::new(filters);
            true
        })
    }

    /// Record a user-visible fetch failure on the feed.
    pub fn set_error(&self, feed_key: &FeedKey, message: impl Into<String>) {
        let message = message.into();
        // Errors are not persisted, so no write is scheduled
        let mut state = self.lock();
        if let Some(feed) = feed_entry(&mut state.feeds, feed_key) {
            feed.error = Some(message);
        }
    }

    /// Write the cache to storage now. Failures are logged and swallowed.
    pub fn flush(&self) {
        let payload = {
            let mut state = self.lock();
            state.persist_pending = false;
            serde_json::to_string(&PersistedCache {
                version: CACHE_VERSION,
                feeds: &state.feeds,
            })
        };

        let payload = match payload {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize feed cache");
                return;
            }
        };

        if let Err(e) = self.inner.storage.set(FEED_CACHE_KEY, &payload) {
            tracing::warn!(error = %e, bytes = payload.len(), "Failed to persist feed cache");
        }
    }

    /// Apply `f` to a feed's state. A refused key leaves the store untouched
    /// and yields `R::default()`.
    fn mutate<R: Default>(&self, feed_key: &FeedKey, f: impl FnOnce(&mut FeedState) -> R) -> R {
        let result = {
            let mut state = self.lock();
            match feed_entry(&mut state.feeds, feed_key) {
                Some(feed) => f(feed),
                None => return R::default(),
            }
        };
        self.schedule_persist();
        result
    }

    fn schedule_persist(&self) {
        {
            let mut state = self.lock();
            if state.persist_pending {
                return;
            }
            state.persist_pending = true;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.clone();
                let delay = self.inner.persist_debounce;
                handle.spawn(async move {
                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                    store.flush();
                });
            }
            // No runtime to defer onto; write through
            Err(_) => self.flush(),
        }
    }
}

/// Existing state of `feed_key`, or a fresh one built from the filters the
/// key encodes. `None` when the key does not parse.
fn feed_entry<'a>(
    feeds: &'a mut BTreeMap<FeedKey, FeedState>,
    feed_key: &FeedKey,
) -> Option<&'a mut FeedState> {
    match feeds.entry(feed_key.clone()) {
        Entry::Occupied(entry) => Some(entry.into_mut()),
        Entry::Vacant(entry) => match feed_key.filters() {
            Some(filters) => Some(entry.insert(FeedState::new(filters))),
            None => {
                tracing::warn!(feed = %feed_key, "Ignoring mutation of unparseable feed key");
                None
            }
        },
    }
}

/// Restore the invariants a hand-edited or stale payload may break: unique
/// item ids (first wins) and a page cursor of at least 1.
fn repair(feed_key: &str, state: &mut FeedState) {
    let before = state.items.len();
    let mut seen = HashSet::with_capacity(before);
    state.items.retain(|item| seen.insert(item.id.clone()));
    if state.items.len() < before {
        tracing::debug!(
            feed = %feed_key,
            duplicates = before - state.items.len(),
            "Dropped duplicate items from cached feed"
        );
    }
    if state.current_page == 0 {
        tracing::debug!(feed = %feed_key, "Cached feed had page 0, clamping to 1");
        state.current_page = 1;
    }
}

/// Load persisted feeds, dropping anything unreadable.
///
/// A feed whose filters fail to parse, or no longer map to the key it was
/// stored under, is discarded individually.
fn rehydrate(storage: &dyn SessionStorage) -> BTreeMap<FeedKey, FeedState> {
    let mut feeds = BTreeMap::new();

    let raw = match storage.get(FEED_CACHE_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return feeds,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read feed cache, starting empty");
            return feeds;
        }
    };

    let doc: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::debug!(error = %e, "Feed cache payload is corrupt, starting empty");
            return feeds;
        }
    };

    if doc.get("version").and_then(|v| v.as_u64()) != Some(u64::from(CACHE_VERSION)) {
        tracing::debug!("Feed cache version mismatch, starting empty");
        return feeds;
    }

    let Some(entries) = doc.get("feeds").and_then(|f| f.as_object()) else {
        return feeds;
    };

    for (key, value) in entries {
        let mut state: FeedState = match serde_json::from_value(value.clone()) {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!(feed = %key, error = %e, "Discarding unreadable cached feed");
                continue;
            }
        };
        if state.filters.feed_key().as_str() != key {
            tracing::debug!(feed = %key, "Discarding cached feed with mismatched filters");
            continue;
        }
        repair(key, &mut state);
        feeds.insert(FeedKey(key.clone()), state);
    }

    tracing::debug!(feeds = feeds.len(), "Rehydrated feed cache");
    feeds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SortMode, TimePeriod};
    use crate::storage::{MemoryStorage, StorageError};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Storage wrapper counting writes.
    #[derive(Default)]
    struct CountingStorage {
        inner: MemoryStorage,
        writes: AtomicUsize,
    }

    impl SessionStorage for CountingStorage {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get(key)
        }
        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set(key, value)
        }
        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove(key)
        }
    }

    fn item(id: &str) -> Item {
        Item::new(id, format!("Meme {id}"), format!("https://cdn.example.com/{id}.jpg"))
    }

    fn ids(state: &FeedState) -> Vec<String> {
        state.items.iter().map(|i| i.id.0.clone()).collect()
    }

    fn newest() -> (FilterSet, FeedKey) {
        let filters = FilterSet::new(SortMode::Newest);
        let key = filters.feed_key();
        (filters, key)
    }

    #[test]
    fn test_unknown_feed_is_uninitialized() {
        let store = FeedStateStore::new(Arc::new(MemoryStorage::new()), Duration::ZERO);
        let state = store.get_state(&FeedKey("nope".into()));
        assert!(!state.is_initialized);
        assert!(state.items.is_empty());
        assert_eq!(state.current_page, 1);
        assert!(state.has_more);
    }

    #[test]
    fn test_append_skips_duplicates_first_wins() {
        let store = FeedStateStore::new(Arc::new(MemoryStorage::new()), Duration::ZERO);
        let (_, key) = newest();

        store.set_items(&key, vec![item("a"), item("b")]);
        let mut replacement = item("b");
        replacement.title = "different title".to_string();
        let inserted = store.append_items(&key, vec![replacement, item("c"), item("c")]);

        assert_eq!(inserted.len(), 1);
        let state = store.get_state(&key);
        assert_eq!(ids(&state), vec!["a", "b", "c"]);
        assert_eq!(state.items[1].title, "Meme b");
    }

    #[test]
    fn test_set_items_resets_page_and_error() {
        let store = FeedStateStore::new(Arc::new(MemoryStorage::new()), Duration::ZERO);
        let (_, key) = newest();

        store.set_items(&key, vec![item("a")]);
        assert!(store.set_page(&key, 3));
        store.set_error(&key, "network down");
        assert_eq!(store.get_state(&key).error.as_deref(), Some("network down"));

        store.set_items(&key, vec![item("z"), item("z")]);
        let state = store.get_state(&key);
        assert_eq!(state.current_page, 1);
        assert!(state.error.is_none());
        assert!(state.is_initialized);
        assert_eq!(ids(&state), vec!["z"]);
    }

    #[test]
    fn test_page_cursor_never_moves_backwards() {
        let store = FeedStateStore::new(Arc::new(MemoryStorage::new()), Duration::ZERO);
        let (_, key) = newest();

        assert!(store.set_page(&key, 2));
        assert!(!store.set_page(&key, 1));
        assert!(!store.set_page(&key, 2));
        assert_eq!(store.get_state(&key).current_page, 2);
    }

    #[test]
    fn test_changed_filters_invalidate_feed() {
        let store = FeedStateStore::new(Arc::new(MemoryStorage::new()), Duration::ZERO);
        let (filters, key) = newest();

        store.set_filters(&key, filters.clone());
        store.set_items(&key, vec![item("a")]);
        assert!(!store.set_filters(&key, filters.clone()));
        assert!(store.get_state(&key).is_initialized);

        // Same key, different filters: an explicit "all" category
        let other = filters.with_category("all");
        assert_eq!(other.feed_key(), key);
        assert!(store.set_filters(&key, other.clone()));
        let state = store.get_state(&key);
        assert!(!state.is_initialized);
        assert!(state.items.is_empty());
        assert_eq!(state.filters, other);
    }

    #[test]
    fn test_filters_of_another_key_are_refused() {
        let store = FeedStateStore::new(Arc::new(MemoryStorage::new()), Duration::ZERO);
        let (filters, key) = newest();
        store.set_filters(&key, filters.clone());
        store.set_items(&key, vec![item("a")]);

        let cats = filters.with_category("cats");
        assert!(!store.set_filters(&key, cats.clone()));
        let state = store.get_state(&key);
        assert!(state.is_initialized);
        assert_eq!(state.filters.category_id, None);
        // The other feed is its own, still unloaded, entry
        assert!(!store.get_state(&cats.feed_key()).is_initialized);
    }

    #[test]
    fn test_unseen_key_takes_filters_from_key() {
        let storage: Arc<dyn SessionStorage> = Arc::new(MemoryStorage::new());
        let filters = FilterSet::new(SortMode::Hottest)
            .with_category("cats")
            .with_period(TimePeriod::Week);
        let key = filters.feed_key();

        let first = FeedStateStore::new(storage.clone(), Duration::ZERO);
        first.set_items(&key, vec![item("a"), item("b")]);
        assert_eq!(first.get_state(&key).filters, filters);
        first.flush();

        let second = FeedStateStore::new(storage, Duration::ZERO);
        let state = second.get_state(&key);
        assert!(state.is_initialized);
        assert_eq!(state.filters, filters);
        assert_eq!(ids(&state), vec!["a", "b"]);
    }

    #[test]
    fn test_unparseable_key_is_never_stored() {
        let storage = Arc::new(CountingStorage::default());
        let store = FeedStateStore::new(storage.clone(), Duration::ZERO);
        let key = FeedKey("garbage".into());

        store.set_items(&key, vec![item("a")]);
        assert!(store.append_items(&key, vec![item("b")]).is_empty());
        assert!(!store.set_page(&key, 3));
        store.set_error(&key, "boom");

        let state = store.get_state(&key);
        assert!(!state.is_initialized);
        assert!(state.items.is_empty());
        assert!(state.error.is_none());
        assert_eq!(storage.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_burst_of_mutations_coalesces_into_one_write() {
        let storage = Arc::new(CountingStorage::default());
        let store = FeedStateStore::new(storage.clone(), Duration::ZERO);
        let (filters, key) = newest();

        store.set_filters(&key, filters);
        store.set_items(&key, vec![item("a")]);
        store.append_items(&key, vec![item("b")]);
        store.set_page(&key, 2);
        store.set_has_more(&key, false);
        assert_eq!(storage.writes.load(Ordering::SeqCst), 0);

        // Let the scheduled persist run
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(storage.writes.load(Ordering::SeqCst), 1);

        // A later mutation schedules a fresh write
        store.set_has_more(&key, true);
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(storage.writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persist_debounce_window() {
        let storage = Arc::new(CountingStorage::default());
        let store = FeedStateStore::new(storage.clone(), Duration::from_millis(50));
        let (_, key) = newest();

        store.set_items(&key, vec![item("a")]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append_items(&key, vec![item("b")]);
        assert_eq!(storage.writes.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_without_runtime_writes_through() {
        let storage = Arc::new(CountingStorage::default());
        let store = FeedStateStore::new(storage.clone(), Duration::ZERO);
        let (_, key) = newest();

        store.set_items(&key, vec![item("a")]);
        assert_eq!(storage.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rehydrates_across_store_instances() {
        let storage: Arc<dyn SessionStorage> = Arc::new(MemoryStorage::new());
        let (filters, key) = newest();

        let first = FeedStateStore::new(storage.clone(), Duration::ZERO);
        first.set_filters(&key, filters.clone());
        first.set_items(&key, vec![item("a"), item("b")]);
        first.set_page(&key, 2);
        first.set_has_more(&key, false);
        first.set_error(&key, "transient");
        first.flush();

        let second = FeedStateStore::new(storage, Duration::ZERO);
        let state = second.get_state(&key);
        assert!(state.is_initialized);
        assert_eq!(ids(&state), vec!["a", "b"]);
        assert_eq!(state.current_page, 2);
        assert!(!state.has_more);
        assert_eq!(state.filters, filters);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_corrupt_payload_treated_as_empty() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(FEED_CACHE_KEY, "{{{ definitely not json").unwrap();

        let store = FeedStateStore::new(storage, Duration::ZERO);
        assert!(!store.get_state(&newest().1).is_initialized);
    }

    #[test]
    fn test_unparseable_filters_discard_only_that_feed() {
        let storage = Arc::new(MemoryStorage::new());
        let (_, key) = newest();
        let payload = serde_json::json!({
            "version": 1,
            "feeds": {
                "all:newest:all": {
                    "items": [],
                    "current_page": 1,
                    "has_more": true,
                    "filters": {"category_id": null, "sort_mode": "newest", "time_period": "all"},
                    "is_initialized": true
                },
                "all:spiciest:all": {
                    "items": [],
                    "current_page": 4,
                    "has_more": true,
                    "filters": {"category_id": null, "sort_mode": "spiciest", "time_period": "all"},
                    "is_initialized": true
                }
            }
        });
        storage.set(FEED_CACHE_KEY, &payload.to_string()).unwrap();

        let store = FeedStateStore::new(storage, Duration::ZERO);
        assert!(store.get_state(&key).is_initialized);
        assert!(!store.get_state(&FeedKey("all:spiciest:all".into())).is_initialized);
    }

    #[test]
    fn test_rehydrate_repairs_duplicates_and_page_zero() {
        let storage = Arc::new(MemoryStorage::new());
        let (_, key) = newest();
        let payload = serde_json::json!({
            "version": 1,
            "feeds": {
                "all:newest:all": {
                    "items": [
                        {"id": "a", "title": "first", "image_url": "https://cdn.example.com/a.jpg"},
                        {"id": "b", "title": "Meme b", "image_url": "https://cdn.example.com/b.jpg"},
                        {"id": "a", "title": "second", "image_url": "https://cdn.example.com/a.jpg"}
                    ],
                    "current_page": 0,
                    "has_more": true,
                    "filters": {"category_id": null, "sort_mode": "newest", "time_period": "all"},
                    "is_initialized": true
                }
            }
        });
        storage.set(FEED_CACHE_KEY, &payload.to_string()).unwrap();

        let store = FeedStateStore::new(storage, Duration::ZERO);
        let state = store.get_state(&key);
        assert_eq!(ids(&state), vec!["a", "b"]);
        assert_eq!(state.items[0].title, "first");
        assert_eq!(state.current_page, 1);
    }

    #[test]
    fn test_quota_exceeded_is_swallowed() {
        let storage = Arc::new(MemoryStorage::with_quota(16));
        let store = FeedStateStore::new(storage.clone(), Duration::ZERO);
        let (_, key) = newest();

        // Write-through fails on quota; the in-memory state is still served
        store.set_items(&key, vec![item("a"), item("b")]);
        assert_eq!(ids(&store.get_state(&key)), vec!["a", "b"]);
        assert!(storage.get(FEED_CACHE_KEY).unwrap().is_none());
    }

    proptest! {
        #[test]
        fn prop_appends_never_duplicate_and_keep_first_seen_order(
            batches in proptest::collection::vec(
                proptest::collection::vec(0u8..40, 0..25),
                0..8,
            )
        ) {
            let store = FeedStateStore::new(Arc::new(MemoryStorage::new()), Duration::ZERO);
            let (_, key) = newest();

            let mut expected: Vec<String> = Vec::new();
            for batch in &batches {
                let items: Vec<Item> = batch.iter().map(|n| item(&n.to_string())).collect();
                store.append_items(&key, items);
                for n in batch {
                    let id = n.to_string();
                    if !expected.contains(&id) {
                        expected.push(id);
                    }
                }
            }

            let state = store.get_state(&key);
            let got = ids(&state);
            let unique: HashSet<&String> = got.iter().collect();
            prop_assert_eq!(unique.len(), got.len());
            prop_assert_eq!(got, expected);
        }
    }
}
