//! Feed data: paged fetching, the persisted feed cache and the session that
//! ties them to a view.
//!
//! - [`source`] - `PageSource` trait and the HTTP implementation
//! - [`state_store`] - `FeedStateStore`, the canonical per-feed cache
//! - [`session`] - `FeedSession`, the view-side load logic
//!
//! # Example
//!
//! ```ignore
//! let store = FeedStateStore::new(storage.clone(), Duration::ZERO);
//! let mut session = FeedSession::new(store, source, storage, options, filters);
//! session.ensure_loaded().await?;
//! session.mount(viewport).await;
//! while let Some(event) = session.next_event().await {
//!     session.handle_event(event).await?;
//! }
//! ```

mod session;
mod source;
mod state_store;

pub use session::{FeedEvent, FeedSession, LoadOutcome, SessionOptions};
pub use source::{FetchError, HttpPageSource, PageSource};
pub use state_store::{FeedStateStore, FEED_CACHE_KEY};

pub(crate) use source::read_limited_bytes;
