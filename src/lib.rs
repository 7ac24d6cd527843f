//! Client-side engine of an infinitely scrolling meme feed.
//!
//! - [`feed`] - feed cache, page fetching and the session driving a view
//! - [`viewport`] - load-more triggering and scroll restoration
//! - [`prefetch`] - background image preloading
//! - [`storage`] - session storage backends
//! - [`config`] - `config.toml` parsing

pub mod config;
pub mod feed;
pub mod model;
pub mod prefetch;
pub mod storage;
pub mod viewport;
