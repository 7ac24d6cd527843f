//! Image prefetching for feed items.
//!
//! A small number of images are fetched right away; the rest trickle in
//! through a background queue so the network stays free for page loads.

mod loader;
mod scheduler;

pub use loader::{HttpImageLoader, ImageLoader, PrefetchError};
pub use scheduler::{
    CacheStats, EntryState, ImagePrefetchScheduler, PrefetchEntry, PrefetchOptions,
    PreloadOutcome, PreloadSummary, Priority,
};
