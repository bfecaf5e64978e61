//! Session lifecycle: connection cache, per-identity operation queue and the
//! manager tying them together.

mod cache;
mod manager;
mod queue;

pub use cache::{CacheEntry, CacheEntryInfo, CacheStats, ConnectionCache, Lease};
pub use manager::SessionManager;
pub use queue::OperationQueue;
