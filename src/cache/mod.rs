//! Cache store set: named, versioned partitions of request→response snapshots.
//!
//! - Every namespace is suffixed with the engine version so generations never share storage
//! - Only GET responses with status 0 or 200 are stored
//! - The crisis namespace is never evicted automatically and can never be emptied explicitly
//! - Undecodable entries are dropped and reported as misses

mod entry;
mod namespace;
mod storage;

pub use entry::{body_digest, CacheStats, CachedEntry};
pub use namespace::{CacheNamespace, EngineVersion, ExpirationPolicy, CACHE_PREFIX};
pub use storage::{CacheHandle, CacheStore};
