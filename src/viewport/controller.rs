use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::gate::LoadMoreGate;
use super::Viewport;
use crate::config::ViewportConfig;

/// Callback invoked when the next page should be requested.
pub type LoadMoreCallback = Arc<dyn Fn() + Send + Sync>;

/// Tuning for [`ViewportLoadController`].
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Distance from the document bottom (px) that counts as "near the end".
    pub threshold_px: f64,
    /// At most one load-more per this window.
    pub rate_limit: Duration,
    /// Delay before deferred re-checks, letting layout settle.
    pub settle_delay: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self::from(&ViewportConfig::default())
    }
}

impl From<&ViewportConfig> for ControllerOptions {
    fn from(config: &ViewportConfig) -> Self {
        Self {
            threshold_px: config.threshold_px,
            rate_limit: config.rate_limit(),
            settle_delay: config.settle_delay(),
        }
    }
}

/// What the feed view currently knows about its list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadStatus {
    pub has_more: bool,
    pub loading: bool,
    pub item_count: usize,
}

/// Source of a load-more request, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Intersection,
    Scroll,
    Mount,
    Rerender,
}

/// Decides when the feed view should fetch its next page.
///
/// Two signals feed one guard: the sentinel after the last item entering the
/// extended viewport (`on_intersection`) and a raw scroll poll (`on_scroll`).
/// Either may fire repeatedly; the callback still runs at most once per
/// rate-limit window, and only while `has_more && !loading`. Requests made
/// while loading are dropped, never queued.
///
/// Two deferred re-checks cover cases where no event will arrive: on mount
/// with restored items already near the bottom, and after new items render
/// into a viewport that is still near the bottom.
///
/// Dropping the controller tears it down.
pub struct ViewportLoadController {
    shared: Arc<Shared>,
}

struct Shared {
    viewport: Arc<dyn Viewport>,
    on_load_more: LoadMoreCallback,
    options: ControllerOptions,
    state: Mutex<ControllerState>,
}

struct ControllerState {
    status: LoadStatus,
    gate: LoadMoreGate,
    mounted: bool,
    torn_down: bool,
    deferred: Option<JoinHandle<()>>,
    /// Bumped per scheduled re-check so a finishing task never clears its successor.
    deferred_generation: u64,
}

impl ViewportLoadController {
    pub fn new(
        viewport: Arc<dyn Viewport>,
        options: ControllerOptions,
        on_load_more: LoadMoreCallback,
    ) -> Self {
        let gate = LoadMoreGate::new(options.rate_limit);
        Self {
            shared: Arc::new(Shared {
                viewport,
                on_load_more,
                options,
                state: Mutex::new(ControllerState {
                    status: LoadStatus::default(),
                    gate,
                    mounted: false,
                    torn_down: false,
                    deferred: None,
                    deferred_generation: 0,
                }),
            }),
        }
    }

    /// Start listening.
    ///
    /// With items already present (restored feed) and the viewport already
    /// within threshold, one deferred check is scheduled, since the user may
    /// never scroll to produce an event.
    pub fn mount(&self, status: LoadStatus) {
        let mut state = self.shared.lock();
        if state.torn_down || state.mounted {
            return;
        }
        state.mounted = true;
        state.status = status;

        let near = self
            .shared
            .viewport
            .metrics()
            .is_near_bottom(self.shared.options.threshold_px);
        tracing::debug!(
            items = status.item_count,
            has_more = status.has_more,
            near_bottom = near,
            "Load controller mounted"
        );
        if status.item_count > 0 && near {
            Shared::schedule_recheck(&self.shared, &mut state, Trigger::Mount);
        }
    }

    /// Push the view's latest status.
    ///
    /// Growth of the item count schedules one deferred re-check of the
    /// distance condition.
    pub fn set_status(&self, status: LoadStatus) {
        let mut state = self.shared.lock();
        let grew = status.item_count > state.status.item_count;
        state.status = status;
        if grew && state.mounted && !state.torn_down {
            Shared::schedule_recheck(&self.shared, &mut state, Trigger::Rerender);
        }
    }

    /// Sentinel visibility changed.
    pub fn on_intersection(&self, is_intersecting: bool) -> bool {
        if !is_intersecting {
            return false;
        }
        self.shared.request(Trigger::Intersection)
    }

    /// Scroll event: fire if the viewport is within threshold of the bottom.
    pub fn on_scroll(&self) -> bool {
        if !self.shared.near_bottom() {
            return false;
        }
        self.shared.request(Trigger::Scroll)
    }

    /// Release listeners and cancel pending checks. No callback fires afterwards.
    pub fn teardown(&self) {
        let mut state = self.shared.lock();
        if state.torn_down {
            return;
        }
        state.torn_down = true;
        if let Some(handle) = state.deferred.take() {
            handle.abort();
            tracing::debug!("Aborted deferred load check on teardown");
        }
    }

    pub fn is_active(&self) -> bool {
        let state = self.shared.lock();
        state.mounted && !state.torn_down
    }
}

impl Drop for ViewportLoadController {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn near_bottom(&self) -> bool {
        self.viewport
            .metrics()
            .is_near_bottom(self.options.threshold_px)
    }

    /// Run the guard chain and fire the callback if everything passes.
    fn request(&self, trigger: Trigger) -> bool {
        {
            let mut state = self.lock();
            if !state.mounted || state.torn_down {
                return false;
            }
            if !state.status.has_more || state.status.loading {
                tracing::trace!(
                    ?trigger,
                    has_more = state.status.has_more,
                    loading = state.status.loading,
                    "Load-more request dropped"
                );
                return false;
            }
            if !state.gate.try_acquire(Instant::now()) {
                tracing::trace!(?trigger, "Load-more request rate limited");
                return false;
            }
        }

        // Callback runs outside the lock so it may call back into the controller
        tracing::debug!(?trigger, "Requesting next page");
        (self.on_load_more)();
        true
    }

    /// Replace any pending re-check with a new one.
    ///
    /// The delay also covers what is left of the rate-limit window, otherwise
    /// a re-check right after a fast fetch would always be swallowed.
    fn schedule_recheck(this: &Arc<Self>, state: &mut ControllerState, trigger: Trigger) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(?trigger, "No runtime for deferred load check, skipping");
            return;
        };

        if let Some(previous) = state.deferred.take() {
            previous.abort();
        }

        let delay = this
            .options
            .settle_delay
            .max(state.gate.remaining(Instant::now()));
        state.deferred_generation += 1;
        let generation = state.deferred_generation;
        let shared = Arc::clone(this);
        state.deferred = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = shared.lock();
                if state.deferred_generation != generation {
                    return;
                }
                state.deferred = None;
            }
            if shared.near_bottom() {
                shared.request(trigger);
            }
        }));
    }
}
