//! Per-operation controllers.
//!
//! A controller owns the full lifecycle of one declared operation: building
//! contexts, running the plugin chain, committing results, and reacting to
//! refetch events while mounted. Framework adapters hold a controller per
//! component and wire `mount` / `unmount` / `update` to the component
//! lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use smol_str::SmolStr;
use tracing::debug;

use fetchbox_core::{Method, RequestOptions, Response, Transport};

use crate::context::Ctx;
use crate::error::Error;
use crate::events::EventBus;
use crate::executor::PluginExecutor;
use crate::plugin::PluginOptions;
use crate::state_manager::StateManager;

mod infinite;
mod operation;
mod queue;

pub use infinite::{
    FetchDirection, InfiniteController, InfinitePaging, InfiniteSpec, InfiniteState, InfiniteView,
    PageRequest,
};
pub use operation::OperationController;
pub use queue::{
    ConcurrencyLimit, QueueConfig, QueueController, QueueInput, QueueItem, QueueItemStatus,
    QueueSpec, QueueStats,
};

/// Shared service handles every controller closes over.
#[derive(Clone)]
pub struct Services {
    /// Process-wide cache and subscription registry.
    pub state: Arc<StateManager>,
    /// Refetch/invalidate signal bus.
    pub events: Arc<EventBus>,
    /// Frozen plugin list.
    pub executor: Arc<PluginExecutor>,
    /// Injected wire transport.
    pub transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("executor", &self.executor)
            .finish()
    }
}

/// Declaration of one operation: where it goes and how plugins treat it.
#[derive(Clone, Debug, Default)]
pub struct OperationSpec {
    /// Request path with optional `:param` placeholders.
    pub path: String,
    /// HTTP method.
    pub method: Method,
    /// Base request options; per-execute options overlay these.
    pub options: RequestOptions,
    /// Tags classifying this operation's cache entries.
    pub tags: Vec<SmolStr>,
    /// Options consumed by plugins.
    pub plugin_options: PluginOptions,
}

impl OperationSpec {
    /// Declares an operation with the given method and path.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        OperationSpec {
            method,
            path: path.into(),
            ..Default::default()
        }
    }

    /// Declares a GET operation.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Declares a POST operation.
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    /// Declares a PUT operation.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    /// Declares a PATCH operation.
    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    /// Declares a DELETE operation.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Sets the base request options.
    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Adds a cache tag.
    pub fn tag(mut self, tag: impl Into<SmolStr>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Replaces the tag list.
    pub fn tags(mut self, tags: impl IntoIterator<Item = SmolStr>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    /// Sets the plugin options.
    pub fn plugin_options(mut self, plugin_options: PluginOptions) -> Self {
        self.plugin_options = plugin_options;
        self
    }
}

/// Wall-clock milliseconds since the epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

/// Allocates a process-unique controller instance id.
pub(crate) fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Builds the leaf fetch closure for the middleware onion.
///
/// With `dedup`, the in-flight future registry is consulted first: the
/// registering caller dispatches the transport and everyone else awaits the
/// shared future. The registration is atomic (insert-if-absent), so exactly
/// one transport call occurs per key however many callers race. Without
/// `dedup` (writes, queue items) every call dispatches.
pub(crate) fn core_fetch(
    transport: Arc<dyn Transport>,
    dedup: bool,
) -> Box<dyn Fn(Ctx) -> BoxFuture<'static, Result<Response, Error>> + Send + Sync> {
    Box::new(move |ctx: Ctx| {
        let transport = Arc::clone(&transport);
        async move {
            let state = Arc::clone(ctx.state());
            let key = ctx.query_key().clone();
            let request = ctx.request_snapshot();
            let signal = request.signal.clone();

            let flight: BoxFuture<'static, Response> = async move {
                tokio::select! {
                    response = transport.send(request) => response,
                    _ = signal.cancelled() => Response::aborted(),
                }
            }
            .boxed();
            let flight = flight.shared();

            if dedup {
                let (shared, registered) = state.register_pending(&key, flight);
                if !registered {
                    debug!(key = %key, "joined in-flight request");
                    #[cfg(feature = "metrics")]
                    metrics::counter!(*crate::metrics::DEDUP_JOIN_COUNTER).increment(1);
                    return Ok(shared.await);
                }
                let response = shared.await;
                state.set_pending(&key, None);
                Ok(response)
            } else {
                Ok(flight.await)
            }
        }
        .boxed()
    })
}
