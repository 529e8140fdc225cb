//! Validation result cache
//!
//! Results are stored per [`CacheKey`] together with the [`ContentHash`] of
//! the inputs they were computed from. A lookup only succeeds when the hash
//! matches, the entry is younger than the configured maximum age, and it was
//! produced by the current validator version.
//!
//! # Layout
//!
//! | Module | Role |
//! |--------|------|
//! | `key` | Cache keys and content hashing |
//! | `entry` | Entry model and validity checks |
//! | `index` | File and dependency reverse index |
//! | `persist` | One-file-per-entry disk storage, background writer |
//! | `store` | The concurrency-safe store tying it together |
//! | `stats` | Counters and maintenance reports |
//! | `inspect` | Offline directory summary, prune and clear |

pub mod entry;
pub mod index;
pub mod inspect;
pub mod key;
mod persist;
pub mod stats;
pub mod store;

pub use entry::{CacheEntry, Metadata};
pub use index::{normalize_path, paths_match, InvalidationIndex};
pub use inspect::{DiskUsage, PruneOptions};
pub use key::{CacheKey, ContentHash};
pub use stats::{CacheStats, MaintenanceReport};
pub use store::{CacheStore, CacheValue, StoreOptions};
