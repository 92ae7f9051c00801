//! Lightning cache layer.
//!
//! - **ExistenceFilter**: per-entity bloom filter gating every detail read
//! - **RequestCoalescer**: one computation per hot key, outcome shared with every waiter
//! - **CacheStore**: entity hashes, rank sets, membership sets and ballots, with a Redis and an
//!   in-process backend
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! backend = "redis"
//! fresh_entity_ttl_seconds = 86400
//! community_ranking_ttl_seconds = 60
//! # ... see config/default.toml for all options
//! ```

mod coalesce;
mod config;
mod filter;
mod keys;
mod memory;
mod redis;
mod store;

pub use coalesce::RequestCoalescer;
pub use config::CachePolicy;
pub use filter::{ExistenceFilter, FilterSizing};
pub use keys::{CacheKey, KEY_PREFIX, hash_value};
pub use memory::MemoryCacheStore;
pub use self::redis::RedisCacheStore;
pub use store::{BallotTransition, CacheError, CacheLookup, CacheStore};
