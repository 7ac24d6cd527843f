//! Viewport-driven loading: when to fetch the next page and where to scroll
//! back to after navigation.
//!
//! - [`ViewportLoadController`] fires a load-more callback near the end of the list
//! - [`ScrollPositionStore`] saves and restores the scroll offset per page
//! - [`Viewport`] is the measurement/scroll surface both of them drive

mod controller;
mod gate;
mod scroll;
mod simulated;

pub use controller::{ControllerOptions, LoadStatus, ViewportLoadController};
pub use gate::LoadMoreGate;
pub use scroll::{
    RestorePhase, ScrollOptions, ScrollPositionStore, ScrollRecord, SCROLL_KEY_PREFIX,
};
pub use simulated::SimulatedViewport;

/// One layout measurement of the scroll container, in logical pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportMetrics {
    pub window_height: f64,
    pub scroll_y: f64,
    pub document_height: f64,
}

impl ViewportMetrics {
    /// True when the bottom edge of the viewport is within `threshold` of the
    /// end of the document.
    pub fn is_near_bottom(&self, threshold: f64) -> bool {
        self.window_height + self.scroll_y >= self.document_height - threshold
    }
}

/// Measurement and scroll surface of the page hosting a feed.
pub trait Viewport: Send + Sync {
    fn metrics(&self) -> ViewportMetrics;
    fn scroll_to(&self, y: f64);
}
