//! Two-Tier Cache Core
//!
//! Read-through/write-through caching with a per-process local tier in front
//! of a shared, cross-process tier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            TieredCache                                   │
//! │      get / set / get_or_set / invalidate_by_tag / invalidate_by_pattern  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  LocalTier (in-process)  │ SharedTier (distributed) │ PopulationLocks    │
//! │  ┌────────────────────┐  │ ┌─────────────────────┐  │ one leader per key │
//! │  │ ShardedMap         │  │ │ SharedBackend       │  │                    │
//! │  │ binary frames      │  │ │ memory | redis      │  ├────────────────────┤
//! │  │ TTL capped (5 min) │  │ │ JSON strings        │  │ InvalidationIndex  │
//! │  └────────────────────┘  │ └─────────────────────┘  │ tags + key registry│
//! │            └───────── Codec ─────────┘              ├────────────────────┤
//! │                                                     │ Accountant         │
//! │                                                     │ per-key hit/miss   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - A `set` is visible to a following `get` on the same node (local tier is
//!   written before the shared call is awaited)
//! - At most one factory runs per key during overlapping `get_or_set` calls
//! - Shared tier failures and timeouts read as misses; only factory failures
//!   and population timeouts reach callers

pub mod accountant;
pub mod codec;
pub mod compression;
pub mod coordinator;
pub mod entry;
pub mod index;
pub mod local;
pub mod optimizer;
pub mod population;
pub mod shard;
pub mod shared;

#[cfg(test)]
mod proptest;

pub use accountant::{PerformanceAccountant, PerformanceMetric};
pub use codec::Codec;
pub use compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
pub use coordinator::{CacheStats, TieredCache, TieredCacheConfig, WriteOutcome, DEFAULT_LOCAL_TTL_CAP};
pub use entry::{CacheEntry, CacheOptions, EntryMetadata, ExpirationKind, ExpirationPolicy, TierOrigin};
pub use index::{GlobPattern, IndexCounts, InvalidationIndex};
pub use local::{CompactionReport, LocalTier, LocalTierConfig, LocalTierStats};
pub use optimizer::{OptimizeReport, Optimizer, WarmupReport};
pub use population::PopulationLocks;
pub use shard::ShardedMap;
pub use shared::{InMemorySharedBackend, RedisSharedBackend, SharedBackend, SharedTier, SharedTierStats};
