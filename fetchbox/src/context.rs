//! The per-call context injected into plugins.
//!
//! One [`PluginContext`] is created per operation execution (and per
//! lifecycle entry point) and shared by reference through the whole chain.
//! Identity fields are immutable; the request snapshot and the scratch map
//! are the only mutable surfaces.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use serde_json::Value;
use smol_str::SmolStr;

use fetchbox_core::{Method, QueryKey, TransportRequest};

use crate::events::EventBus;
use crate::plugin::{OperationType, Plugin, PluginOptions};
use crate::state_manager::StateManager;

/// Shared handle to a per-call context.
pub type Ctx = Arc<PluginContext>;

/// Everything a plugin can see about the call it participates in.
pub struct PluginContext {
    operation: OperationType,
    path: String,
    method: Method,
    query_key: QueryKey,
    tags: Vec<SmolStr>,
    request_timestamp: i64,
    instance_id: u64,
    request: Mutex<TransportRequest>,
    state: Arc<StateManager>,
    events: Arc<EventBus>,
    temp: DashMap<SmolStr, Value>,
    plugin_options: PluginOptions,
    force_refetch: AtomicBool,
    plugins: Vec<Arc<dyn Plugin>>,
}

/// Inputs for building a context; the executor injects the plugin list.
pub struct ContextInput {
    /// Operation type of this call.
    pub operation: OperationType,
    /// Request path.
    pub path: String,
    /// Request method.
    pub method: Method,
    /// Canonical key of this call.
    pub query_key: QueryKey,
    /// Tags the operation was declared with.
    pub tags: Vec<SmolStr>,
    /// Timestamp distinguishing same-mount from new-lifecycle executions.
    pub request_timestamp: i64,
    /// Identity of the owning controller instance.
    pub instance_id: u64,
    /// Mutable request snapshot, headers already resolved.
    pub request: TransportRequest,
    /// State manager handle.
    pub state: Arc<StateManager>,
    /// Event bus handle.
    pub events: Arc<EventBus>,
    /// Per-call plugin options.
    pub plugin_options: PluginOptions,
}

impl PluginContext {
    pub(crate) fn new(input: ContextInput, plugins: Vec<Arc<dyn Plugin>>) -> Ctx {
        Arc::new(PluginContext {
            operation: input.operation,
            path: input.path,
            method: input.method,
            query_key: input.query_key,
            tags: input.tags,
            request_timestamp: input.request_timestamp,
            instance_id: input.instance_id,
            request: Mutex::new(input.request),
            state: input.state,
            events: input.events,
            temp: DashMap::new(),
            plugin_options: input.plugin_options,
            force_refetch: AtomicBool::new(false),
            plugins,
        })
    }

    /// Operation type of this call.
    pub fn operation(&self) -> OperationType {
        self.operation
    }

    /// Request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Canonical key of this call.
    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    /// Tags the operation was declared with.
    pub fn tags(&self) -> &[SmolStr] {
        &self.tags
    }

    /// Timestamp assigned when this execution began.
    pub fn request_timestamp(&self) -> i64 {
        self.request_timestamp
    }

    /// Identity of the owning controller instance.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// State manager handle.
    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// Event bus handle.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Per-call plugin options.
    pub fn plugin_options(&self) -> &PluginOptions {
        &self.plugin_options
    }

    /// Mutates the request snapshot in place.
    pub fn with_request<R>(&self, f: impl FnOnce(&mut TransportRequest) -> R) -> R {
        f(&mut self.lock_request())
    }

    /// Clones the current request snapshot.
    pub fn request_snapshot(&self) -> TransportRequest {
        self.lock_request().clone()
    }

    /// Reads a scratch value.
    pub fn get_temp(&self, key: &str) -> Option<Value> {
        self.temp.get(key).map(|value| value.clone())
    }

    /// Writes a scratch value; lives for the duration of the call.
    pub fn set_temp(&self, key: impl Into<SmolStr>, value: Value) {
        self.temp.insert(key.into(), value);
    }

    /// Whether cache/throttle/debounce short-circuits are bypassed.
    pub fn force_refetch(&self) -> bool {
        self.force_refetch.load(Ordering::SeqCst)
    }

    /// Bypasses cache/throttle/debounce short-circuits for this call.
    pub fn set_force_refetch(&self, force: bool) {
        self.force_refetch.store(force, Ordering::SeqCst);
    }

    /// Resolves the named plugin's capability object, if the plugin is
    /// registered and exports one.
    pub fn plugin_exports(self: &Arc<Self>, name: &str) -> Option<Box<dyn Any + Send + Sync>> {
        let plugin = self
            .plugins
            .iter()
            .find(|plugin| plugin.name() == name)?
            .clone();
        plugin.exports(self)
    }

    /// Whether the named plugin is registered.
    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|plugin| plugin.name() == name)
    }

    fn lock_request(&self) -> MutexGuard<'_, TransportRequest> {
        self.request.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("operation", &self.operation)
            .field("path", &self.path)
            .field("method", &self.method)
            .field("query_key", &self.query_key)
            .field("instance_id", &self.instance_id)
            .field("request_timestamp", &self.request_timestamp)
            .finish()
    }
}
