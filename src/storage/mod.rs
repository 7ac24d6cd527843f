//! Session-scoped key/value storage used by the feed cache and scroll store.

mod error;
mod file;
mod session;

pub use error::StorageError;
pub use file::FileStorage;
pub use session::{MemoryStorage, SessionStorage};
