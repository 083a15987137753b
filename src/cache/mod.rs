//! Local audio cache.
//!
//! Provides a [`CacheStore`] that owns the flat on-disk blob directory, and
//! [`KeyLocks`] used by the proxy to collapse concurrent fills of one key
//! into a single upstream fetch.

pub mod flight;
pub mod store;

pub use flight::KeyLocks;
pub use store::{CacheError, CacheStore};
