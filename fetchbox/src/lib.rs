#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

/// Per-operation controllers: read/write, infinite read, and queue.
///
/// Controllers coordinate fetching, deduplication, commits, and lifecycle
/// hooks for one declared operation. Framework adapters hold one per
/// component.
pub mod controller;

/// The per-call context injected into plugins.
pub mod context;

/// Error types: plugin graph construction, middleware, lifecycle.
pub mod error;

/// Named-topic pub/sub carrying refetch and invalidation signals.
pub mod events;

/// Plugin ordering, middleware composition, and lifecycle fan-out.
pub mod executor;

/// The composition root tying services and controllers together.
pub mod layer;

/// Metrics collection for data-layer observability.
///
/// When the `metrics` feature is enabled, this module provides counters
/// for cache hits/misses, request deduplication, and queue settlement.
pub mod metrics;

/// The plugin contract and per-call plugin options.
pub mod plugin;

/// Built-in plugins: cache, initial data, refetch, invalidation, debounce,
/// throttle, optimistic updates.
pub mod plugins;

/// A FIFO counting semaphore with dynamic capacity, backing the queue
/// controller.
pub mod semaphore;

/// The process-wide cache and subscription registry.
pub mod state_manager;

pub use fetchbox_core::{
    AbortController, AbortSignal, CacheEntry, CachePatch, DecodedKey, FnTransport, HeaderSource,
    Method, MetaMap, OperationState, PatchOp, QueryKey, RequestOptions, Response, StatePatch,
    Transport, TransportRequest,
};

pub use controller::{
    ConcurrencyLimit, FetchDirection, InfiniteController, InfinitePaging, InfiniteSpec,
    InfiniteState, InfiniteView, OperationController, OperationSpec, PageRequest, QueueConfig,
    QueueController, QueueInput, QueueItem, QueueItemStatus, QueueSpec, QueueStats,
};
pub use error::{Error, PluginError};
pub use events::{Event, EventBus, RefetchEvent, RefetchReason, Subscription};
pub use executor::{LifecyclePhase, Next, PluginExecutor};
pub use layer::{DataLayer, DataLayerBuilder};
pub use plugin::{OperationType, Plugin, PluginOptions};
pub use state_manager::StateManager;

/// The `fetchbox` prelude.
///
/// Provides convenient access to the most commonly used types:
///
/// ```rust
/// use fetchbox::prelude::*;
/// ```
pub mod prelude {
    pub use crate::controller::{
        InfinitePaging, InfiniteSpec, OperationSpec, QueueConfig, QueueInput, QueueSpec,
    };
    pub use crate::layer::{DataLayer, DataLayerBuilder};
    pub use crate::plugin::{OperationType, Plugin, PluginOptions};
    pub use crate::{Error, Method, RequestOptions, Response};
}
