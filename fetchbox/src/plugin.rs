//! The plugin contract.
//!
//! A plugin packages one cross-cutting concern of the data layer: caching,
//! rate limiting, optimistic writes. It declares which operation types it
//! applies to, may wrap the transport call in a middleware, may observe
//! settled responses, and may hook the controller lifecycle to run
//! background machinery (event subscriptions, timers).
//!
//! Ordering between plugins is declared through `dependencies`, never
//! through numeric priorities: the executor topologically sorts the
//! registered list and fails construction on unknown names or cycles.

use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use smol_str::SmolStr;

use fetchbox_core::Response;

use crate::context::Ctx;
use crate::error::Error;
use crate::executor::Next;
use crate::plugins::debounce::Debounce;
use crate::plugins::invalidation::InvalidationMode;
use crate::plugins::optimistic::OptimisticTarget;

/// The kind of operation a controller performs.
///
/// Plugins declare the subset they apply to; the executor filters the chain
/// per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    /// Cacheable single fetch.
    Read,
    /// Mutation; never deduplicated, never served from cache.
    Write,
    /// Paginated composite of reads.
    InfiniteRead,
    /// Queued write-style item.
    Queue,
}

impl OperationType {
    /// Returns the operation type as a string slice.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationType::Read => "read",
            OperationType::Write => "write",
            OperationType::InfiniteRead => "infiniteRead",
            OperationType::Queue => "queue",
        }
    }
}

/// A unit of cross-cutting behavior around operations.
///
/// Every hook has a default so implementations only write what they need.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Unique plugin name, used for dependency resolution and
    /// [`exports`](Plugin::exports) discovery.
    fn name(&self) -> &str;

    /// The operation types this plugin participates in.
    fn operations(&self) -> &[OperationType];

    /// Names of plugins that must run before this one.
    fn dependencies(&self) -> Vec<SmolStr> {
        Vec::new()
    }

    /// Wraps the rest of the chain. Call `next.run(ctx)` to descend;
    /// return without calling it to short-circuit.
    async fn middleware(&self, ctx: &Ctx, next: Next<'_>) -> Result<Response, Error> {
        next.run(ctx).await
    }

    /// Observes the settled response after the chain unwound. Returning
    /// `Some` replaces the response for subsequent `after_response` hooks
    /// and the caller. Not invoked when the chain errored.
    async fn after_response(&self, _ctx: &Ctx, _response: &Response) -> Result<Option<Response>, Error> {
        Ok(None)
    }

    /// Controller mounted.
    async fn on_mount(&self, _ctx: &Ctx) -> Result<(), Error> {
        Ok(())
    }

    /// Controller unmounted.
    async fn on_unmount(&self, _ctx: &Ctx) -> Result<(), Error> {
        Ok(())
    }

    /// Controller inputs changed while mounted; `prev` is the context of
    /// the previous configuration.
    async fn on_update(&self, _ctx: &Ctx, _prev: &Ctx) -> Result<(), Error> {
        Ok(())
    }

    /// Capability object other plugins can discover via
    /// `ctx.plugin_exports(name)`. Callers downcast to the concrete type.
    fn exports(&self, _ctx: &Ctx) -> Option<Box<dyn Any + Send + Sync>> {
        None
    }
}

/// Per-call options consumed by plugins.
///
/// Carried on the context as an opaque blob from the plugins' point of
/// view: each built-in reads its own fields, third-party plugins read
/// `extra` under their own keys.
#[derive(Clone, Default)]
pub struct PluginOptions {
    /// Cache plugin: how long a committed entry stays fresh.
    pub stale_time: Option<Duration>,
    /// Initial-data plugin: one-shot seed for this hook instance.
    pub initial_data: Option<Value>,
    /// Initial-data plugin: refetch in the background after seeding.
    pub refetch_on_initial_data: bool,
    /// Refetch plugin: re-execute when the host regains focus.
    pub refetch_on_focus: bool,
    /// Refetch plugin: re-execute when the host regains connectivity.
    pub refetch_on_reconnect: bool,
    /// Debounce plugin: coalescing window.
    pub debounce: Option<Debounce>,
    /// Throttle plugin: at-most-once window.
    pub throttle: Option<Duration>,
    /// Optimistic plugin: targets to update provisionally.
    pub optimistic: Vec<OptimisticTarget>,
    /// Invalidation plugin: per-call mode override.
    pub invalidation_mode: Option<InvalidationMode>,
    /// Options for third-party plugins, keyed by plugin name.
    pub extra: HashMap<SmolStr, Value>,
}

impl PluginOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache freshness window.
    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    /// Sets the one-shot initial data seed.
    pub fn initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(data);
        self
    }

    /// Refetch in the background after seeding initial data.
    pub fn refetch_on_initial_data(mut self) -> Self {
        self.refetch_on_initial_data = true;
        self
    }

    /// Re-execute when the host regains focus.
    pub fn refetch_on_focus(mut self) -> Self {
        self.refetch_on_focus = true;
        self
    }

    /// Re-execute when the host regains connectivity.
    pub fn refetch_on_reconnect(mut self) -> Self {
        self.refetch_on_reconnect = true;
        self
    }

    /// Sets the debounce window.
    pub fn debounce(mut self, debounce: impl Into<Debounce>) -> Self {
        self.debounce = Some(debounce.into());
        self
    }

    /// Sets the throttle window.
    pub fn throttle(mut self, window: Duration) -> Self {
        self.throttle = Some(window);
        self
    }

    /// Adds an optimistic target.
    pub fn optimistic(mut self, target: OptimisticTarget) -> Self {
        self.optimistic.push(target);
        self
    }

    /// Overrides the invalidation mode for this call.
    pub fn invalidation_mode(mut self, mode: InvalidationMode) -> Self {
        self.invalidation_mode = Some(mode);
        self
    }

    /// Sets an option blob for a third-party plugin.
    pub fn extra(mut self, plugin: impl Into<SmolStr>, value: Value) -> Self {
        self.extra.insert(plugin.into(), value);
        self
    }
}

impl std::fmt::Debug for PluginOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginOptions")
            .field("stale_time", &self.stale_time)
            .field("initial_data", &self.initial_data.is_some())
            .field("refetch_on_focus", &self.refetch_on_focus)
            .field("refetch_on_reconnect", &self.refetch_on_reconnect)
            .field("debounce", &self.debounce.is_some())
            .field("throttle", &self.throttle)
            .field("optimistic_targets", &self.optimistic.len())
            .field("invalidation_mode", &self.invalidation_mode)
            .finish()
    }
}
