use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::Viewport;
use crate::config::ScrollConfig;
use crate::storage::SessionStorage;

/// Storage key prefix for saved offsets; the page key follows verbatim.
pub const SCROLL_KEY_PREFIX: &str = "memefeed.scroll:";

/// Persisted scroll offset of one page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollRecord {
    pub offset_y: f64,
    pub saved_at_epoch_ms: i64,
}

/// Restoration state of one page key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestorePhase {
    #[default]
    Idle,
    /// A programmatic jump is scheduled; saves are suppressed.
    Restoring,
}

#[derive(Debug, Clone)]
pub struct ScrollOptions {
    /// Records older than this are discarded on read.
    pub ttl: Duration,
    /// Quiet period after the last scroll event before saving.
    pub debounce: Duration,
    /// Wait before the restore jump, letting layout settle for one frame.
    pub frame: Duration,
}

impl Default for ScrollOptions {
    fn default() -> Self {
        Self::from(&ScrollConfig::default())
    }
}

impl From<&ScrollConfig> for ScrollOptions {
    fn from(config: &ScrollConfig) -> Self {
        Self {
            ttl: config.ttl(),
            debounce: config.debounce(),
            frame: config.frame(),
        }
    }
}

/// Saves and restores the scroll offset of pages, independent of their data.
///
/// One instance lives for one mount of a view: each page key is restored at
/// most once per instance. Saves are driven by debounced scroll events
/// (`on_scroll` + `tick`), page-hide and before-unload. All storage problems
/// are logged and swallowed; a corrupt or expired record is deleted.
pub struct ScrollPositionStore {
    storage: Arc<dyn SessionStorage>,
    viewport: Arc<dyn Viewport>,
    options: ScrollOptions,
    state: Mutex<ScrollState>,
}

#[derive(Default)]
struct ScrollState {
    phases: HashMap<String, RestorePhase>,
    restored: HashSet<String>,
    /// Page key and time of the latest unsaved scroll event.
    pending_save: Option<(String, Instant)>,
}

impl ScrollPositionStore {
    pub fn new(
        storage: Arc<dyn SessionStorage>,
        viewport: Arc<dyn Viewport>,
        options: ScrollOptions,
    ) -> Self {
        Self {
            storage,
            viewport,
            options,
            state: Mutex::new(ScrollState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScrollState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn storage_key(page_key: &str) -> String {
        format!("{SCROLL_KEY_PREFIX}{page_key}")
    }

    pub fn phase(&self, page_key: &str) -> RestorePhase {
        self.lock().phases.get(page_key).copied().unwrap_or_default()
    }

    /// Persist the current scroll offset for `page_key`.
    ///
    /// No-op while the page is restoring, so a pending jump never overwrites
    /// the offset it is about to apply. Returns whether a record was written.
    pub fn save(&self, page_key: &str) -> bool {
        if self.phase(page_key) == RestorePhase::Restoring {
            tracing::trace!(page = %page_key, "Skipping scroll save during restore");
            return false;
        }

        let record = ScrollRecord {
            offset_y: self.viewport.metrics().scroll_y.max(0.0),
            saved_at_epoch_ms: Utc::now().timestamp_millis(),
        };
        let payload = match serde_json::to_string(&record) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(page = %page_key, error = %e, "Failed to serialize scroll record");
                return false;
            }
        };

        match self.storage.set(&Self::storage_key(page_key), &payload) {
            Ok(()) => {
                tracing::trace!(page = %page_key, offset = record.offset_y, "Saved scroll position");
                true
            }
            Err(e) => {
                tracing::warn!(page = %page_key, error = %e, "Failed to save scroll position");
                false
            }
        }
    }

    /// Note a scroll event; the save happens once scrolling has been quiet
    /// for the debounce period (see [`tick`](Self::tick)).
    pub fn on_scroll(&self, page_key: &str) {
        let mut state = self.lock();
        if let Some((previous, _)) = &state.pending_save {
            if previous != page_key {
                // Navigated mid-debounce: the old page's pending save is lost
                tracing::debug!(page = %previous, "Dropping pending scroll save for previous page");
            }
        }
        state.pending_save = Some((page_key.to_string(), Instant::now()));
    }

    /// Run a debounced save whose quiet period has elapsed.
    ///
    /// Returns whether a save was attempted.
    pub fn tick(&self) -> bool {
        let due = {
            let mut state = self.lock();
            match &state.pending_save {
                Some((_, at)) if at.elapsed() >= self.options.debounce => {
                    state.pending_save.take().map(|(key, _)| key)
                }
                _ => None,
            }
        };
        match due {
            Some(page_key) => {
                self.save(&page_key);
                true
            }
            None => false,
        }
    }

    /// Page hidden (visibility change, navigation): save now.
    pub fn on_page_hide(&self, page_key: &str) -> bool {
        self.clear_pending(page_key);
        self.save(page_key)
    }

    /// Page about to unload: save now.
    pub fn on_before_unload(&self, page_key: &str) -> bool {
        self.on_page_hide(page_key)
    }

    fn clear_pending(&self, page_key: &str) {
        let mut state = self.lock();
        if matches!(&state.pending_save, Some((key, _)) if key == page_key) {
            state.pending_save = None;
        }
    }

    /// Read a record, purging it if corrupt or older than the TTL.
    pub fn load_record(&self, page_key: &str) -> Option<ScrollRecord> {
        let key = Self::storage_key(page_key);
        let raw = match self.storage.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(page = %page_key, error = %e, "Failed to read scroll position");
                return None;
            }
        };

        let record = match serde_json::from_str::<ScrollRecord>(&raw) {
            Ok(r) if r.offset_y.is_finite() && r.offset_y >= 0.0 => r,
            Ok(_) | Err(_) => {
                tracing::debug!(page = %page_key, "Discarding corrupt scroll record");
                self.purge(&key);
                return None;
            }
        };

        let age_ms = Utc::now().timestamp_millis() - record.saved_at_epoch_ms;
        if age_ms > self.options.ttl.as_millis() as i64 {
            tracing::debug!(page = %page_key, age_ms = age_ms, "Discarding expired scroll record");
            self.purge(&key);
            return None;
        }

        Some(record)
    }

    fn purge(&self, storage_key: &str) {
        if let Err(e) = self.storage.remove(storage_key) {
            tracing::warn!(key = %storage_key, error = %e, "Failed to remove scroll record");
        }
    }

    /// Jump back to the saved offset of `page_key`, at most once per mount.
    ///
    /// The jump waits one frame so the restored content has laid out. Returns
    /// the offset applied, or `None` when there was nothing valid to restore.
    pub async fn restore(&self, page_key: &str) -> Option<f64> {
        {
            let mut state = self.lock();
            if !state.restored.insert(page_key.to_string()) {
                return None;
            }
        }

        let record = self.load_record(page_key)?;

        let _phase = PhaseGuard::enter(self, page_key);
        tokio::time::sleep(self.options.frame).await;
        self.viewport.scroll_to(record.offset_y);
        tracing::debug!(page = %page_key, offset = record.offset_y, "Restored scroll position");
        Some(record.offset_y)
    }
}

/// Holds a page in `Restoring`, returning it to `Idle` on drop even if the
/// restore future is cancelled mid-flight.
struct PhaseGuard<'a> {
    store: &'a ScrollPositionStore,
    page_key: &'a str,
}

impl<'a> PhaseGuard<'a> {
    fn enter(store: &'a ScrollPositionStore, page_key: &'a str) -> Self {
        store
            .lock()
            .phases
            .insert(page_key.to_string(), RestorePhase::Restoring);
        Self { store, page_key }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.store
            .lock()
            .phases
            .insert(self.page_key.to_string(), RestorePhase::Idle);
    }
}
