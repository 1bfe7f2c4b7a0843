//! # strata-engine
//!
//! Context resolution, caching, versioning, batching, notification and search.
//!
//! - **Resolver**: GLOBAL → PROJECT → BRANCH → TASK chain walk and payload merge
//! - **Cache**: version-indexed read-through cache with zlib compression
//! - **Write path**: validation, then store, then invalidation and events
//! - **Batch executor**: transactional or lane-parallel mutation sets
//! - **Notification publisher**: scoped per-subscriber broadcast channels
//! - **Search**: payload scan with pluggable match modes
//! - **Service**: `ContextService` wires everything from `StrataSettings`
//!
//! ## Crate Position
//!
//! Depends on: strata-core, strata-store.
//! Depended on by: strata-server and the `strata` binary.

#![deny(unsafe_code)]

pub mod batch;
pub mod cache;
pub mod notify;
pub mod resolver;
pub mod search;
pub mod service;
pub mod testing;
pub mod versioning;
pub mod write;

pub use batch::{
    BatchAction, BatchExecutor, BatchOperation, BatchReport, BatchRequest, BatchState, OperationOutcome,
    OperationResult,
};
pub use cache::{CacheBackend, CacheLayer, CacheStats, MemoryCacheBackend};
pub use notify::{EventFilter, NotificationPublisher, Subscription, SubscriptionInfo, SubscriptionScope};
pub use resolver::{MergeStrategy, MergedView, Resolver};
pub use search::{MatchMode, SearchEngine, SearchHit, SearchQuery};
pub use service::{ContextService, HealthReport, ResolveOptions};
pub use versioning::VersionManager;
pub use write::WritePath;
