use std::sync::Mutex;

use super::{Viewport, ViewportMetrics};

/// Headless viewport with a fixed window height.
///
/// Drives the engine from the command-line walker and from tests. Scrolling
/// is clamped to the document like a real page, and every `scroll_to` jump is
/// recorded.
#[derive(Debug)]
pub struct SimulatedViewport {
    state: Mutex<SimState>,
}

#[derive(Debug)]
struct SimState {
    metrics: ViewportMetrics,
    jumps: Vec<f64>,
}

impl SimulatedViewport {
    pub fn new(window_height: f64, document_height: f64) -> Self {
        Self {
            state: Mutex::new(SimState {
                metrics: ViewportMetrics {
                    window_height,
                    scroll_y: 0.0,
                    document_height,
                },
                jumps: Vec::new(),
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Resize the document (new content rendered). Scroll stays put unless it
    /// would now be past the end.
    pub fn set_document_height(&self, document_height: f64) {
        self.with_state(|s| {
            s.metrics.document_height = document_height;
            s.metrics.scroll_y = clamp_scroll(&s.metrics, s.metrics.scroll_y);
        });
    }

    /// User scroll, as opposed to a programmatic `scroll_to`.
    pub fn user_scroll_to(&self, y: f64) {
        self.with_state(|s| s.metrics.scroll_y = clamp_scroll(&s.metrics, y));
    }

    pub fn user_scroll_to_bottom(&self) {
        self.with_state(|s| {
            s.metrics.scroll_y = clamp_scroll(&s.metrics, s.metrics.document_height)
        });
    }

    /// Programmatic jumps made through `Viewport::scroll_to`, oldest first.
    pub fn jumps(&self) -> Vec<f64> {
        self.with_state(|s| s.jumps.clone())
    }
}

fn clamp_scroll(metrics: &ViewportMetrics, y: f64) -> f64 {
    let max = (metrics.document_height - metrics.window_height).max(0.0);
    y.clamp(0.0, max)
}

impl Viewport for SimulatedViewport {
    fn metrics(&self) -> ViewportMetrics {
        self.with_state(|s| s.metrics)
    }

    fn scroll_to(&self, y: f64) {
        self.with_state(|s| {
            s.metrics.scroll_y = clamp_scroll(&s.metrics, y);
            s.jumps.push(y);
        });
    }
}
