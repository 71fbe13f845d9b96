//! The single-request controller for reads and writes.
//!
//! One [`OperationController`] drives one declared operation. Reads are
//! deduplicated through the in-flight future registry and may be served by
//! the cache plugin; writes are never deduplicated, never served from
//! cache, and their successful completion triggers invalidation (through
//! the invalidation plugin when registered, directly otherwise).
//!
//! While mounted, the controller owns the refetch events matching its
//! current query key and reacts by re-executing with the force flag set,
//! bypassing cache/debounce/throttle short-circuits.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use serde_json::Value;
use smol_str::SmolStr;
use tracing::{debug, warn};

use fetchbox_core::{
    AbortController, CachePatch, OperationState, QueryKey, RequestOptions, Response,
    TransportRequest,
};

use crate::context::{ContextInput, Ctx};
use crate::error::Error;
use crate::events::{Event, Subscription, topic};
use crate::executor::LifecyclePhase;
use crate::plugin::{OperationType, PluginOptions};
use crate::plugins::invalidation;

use super::{OperationSpec, Services, core_fetch, next_instance_id, now_millis};

struct OperationInner {
    operation: OperationType,
    spec: OperationSpec,
    services: Services,
    instance_id: u64,
    plugin_options: Mutex<PluginOptions>,
    metadata: DashMap<SmolStr, Value>,
    current_key: Mutex<QueryKey>,
    abort: Mutex<Option<AbortController>>,
    current_request_timestamp: AtomicI64,
    first_execute_done: AtomicBool,
    listeners: Mutex<Vec<Subscription>>,
}

/// Controller for a single read or write operation.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct OperationController {
    inner: Arc<OperationInner>,
}

impl OperationController {
    pub(crate) fn new(operation: OperationType, spec: OperationSpec, services: Services) -> Self {
        let current_key = QueryKey::for_request(&spec.path, spec.method, &spec.options);
        let plugin_options = spec.plugin_options.clone();
        OperationController {
            inner: Arc::new(OperationInner {
                operation,
                spec,
                services,
                instance_id: next_instance_id(),
                plugin_options: Mutex::new(plugin_options),
                metadata: DashMap::new(),
                current_key: Mutex::new(current_key),
                abort: Mutex::new(None),
                current_request_timestamp: AtomicI64::new(now_millis()),
                first_execute_done: AtomicBool::new(false),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The key of the most recently executed (or declared) request.
    pub fn query_key(&self) -> QueryKey {
        lock(&self.inner.current_key).clone()
    }

    /// Runs the operation through the plugin chain and commits on success.
    ///
    /// `options` overlays the declared base options for this call only.
    /// `force` bypasses cache/debounce/throttle short-circuits.
    pub async fn execute(
        &self,
        options: Option<RequestOptions>,
        force: bool,
    ) -> Result<Response, Error> {
        let inner = &self.inner;
        let merged = match &options {
            Some(overlay) => inner.spec.options.merged_with(overlay),
            None => inner.spec.options.clone(),
        };
        let key = QueryKey::for_request(&inner.spec.path, inner.spec.method, &merged);
        *lock(&inner.current_key) = key.clone();

        // Every execute after the first one of a mount gets a fresh
        // timestamp; the first reuses the one assigned at mount.
        let request_timestamp = if inner.first_execute_done.swap(true, Ordering::SeqCst) {
            let now = now_millis();
            inner.current_request_timestamp.store(now, Ordering::SeqCst);
            now
        } else {
            inner.current_request_timestamp.load(Ordering::SeqCst)
        };

        let abort = AbortController::new();
        *lock(&inner.abort) = Some(abort.clone());

        let ctx = self
            .build_context(&merged, key.clone(), request_timestamp, abort)
            .await;
        if force {
            ctx.set_force_refetch(true);
        }

        let dedup = inner.operation == OperationType::Read;
        let core = core_fetch(Arc::clone(&inner.services.transport), dedup);
        let response = inner
            .services
            .executor
            .execute_middleware(inner.operation, &ctx, &core)
            .await?;

        if response.is_success()
            && let Some(data) = response.data.clone()
        {
            inner.services.state.set_cache(
                &key,
                CachePatch::commit(data, now_millis()).tags(inner.spec.tags.clone()),
            );
        }

        // A successful write invalidates its tags directly when no
        // invalidation plugin is registered to do it.
        if inner.operation == OperationType::Write
            && response.is_success()
            && !inner.services.executor.has_plugin(invalidation::NAME)
            && !inner.spec.tags.is_empty()
        {
            inner.services.state.mark_stale(&inner.spec.tags);
            inner
                .services
                .events
                .emit(Event::Invalidate(inner.spec.tags.clone()));
        }

        Ok(response)
    }

    /// The cached state for this operation's key, or the initial state.
    pub fn get_state(&self) -> OperationState {
        let key = self.query_key();
        self.inner
            .services
            .state
            .get_cache(&key)
            .map(|entry| entry.state)
            .unwrap_or_default()
    }

    /// Forwards to the state manager's per-key subscription.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        let key = self.query_key();
        self.inner.services.state.subscribe_cache(&key, callback)
    }

    /// Aborts the in-flight transport call, if any.
    pub fn abort(&self) {
        if let Some(abort) = lock(&self.inner.abort).take() {
            abort.abort();
        }
    }

    /// Re-executes with the declared options.
    pub async fn refetch(&self) -> Result<Response, Error> {
        self.execute(None, false).await
    }

    /// Drives plugin `on_mount` hooks and starts listening for refetch
    /// events owned by this controller.
    pub async fn mount(&self) -> Result<(), Error> {
        let inner = &self.inner;
        inner
            .current_request_timestamp
            .store(now_millis(), Ordering::SeqCst);
        inner.first_execute_done.store(false, Ordering::SeqCst);

        let ctx = self.get_context().await;
        inner
            .services
            .executor
            .execute_lifecycle(LifecyclePhase::Mount, inner.operation, &ctx)
            .await?;

        let mut listeners = Vec::new();
        let weak = Arc::downgrade(&self.inner);
        listeners.push(inner.services.events.subscribe(topic::REFETCH, move |event| {
            if let Event::Refetch(refetch) = event
                && let Some(inner) = weak.upgrade()
                && *lock(&inner.current_key) == refetch.query_key
            {
                debug!(reason = refetch.reason.as_str(), "refetch event owned");
                spawn_forced_execute(OperationController { inner });
            }
        }));
        let weak = Arc::downgrade(&self.inner);
        listeners.push(
            inner
                .services
                .events
                .subscribe(topic::REFETCH_ALL, move |_| {
                    if let Some(inner) = weak.upgrade() {
                        spawn_forced_execute(OperationController { inner });
                    }
                }),
        );
        *lock(&inner.listeners) = listeners;
        Ok(())
    }

    /// Drives plugin `on_unmount` hooks and removes refetch listeners.
    pub async fn unmount(&self) -> Result<(), Error> {
        let inner = &self.inner;
        for listener in lock(&inner.listeners).drain(..) {
            listener.unsubscribe();
        }
        let ctx = self.get_context().await;
        inner
            .services
            .executor
            .execute_lifecycle(LifecyclePhase::Unmount, inner.operation, &ctx)
            .await
    }

    /// Drives plugin `on_update` hooks with the previous context.
    pub async fn update(&self, prev: &Ctx) -> Result<(), Error> {
        let ctx = self.get_context().await;
        self.inner
            .services
            .executor
            .execute_update_lifecycle(self.inner.operation, &ctx, prev)
            .await
    }

    /// Builds a fresh context for lifecycle bookkeeping.
    pub async fn get_context(&self) -> Ctx {
        let inner = &self.inner;
        let key = self.query_key();
        let timestamp = inner.current_request_timestamp.load(Ordering::SeqCst);
        self.build_context(&inner.spec.options, key, timestamp, AbortController::new())
            .await
    }

    /// Replaces the plugin options used by subsequent calls.
    pub fn set_plugin_options(&self, plugin_options: PluginOptions) {
        *lock(&self.inner.plugin_options) = plugin_options;
    }

    /// Stamps a per-controller metadata value, copied into every context's
    /// scratch map.
    pub fn set_metadata(&self, key: impl Into<SmolStr>, value: Value) {
        self.inner.metadata.insert(key.into(), value);
    }

    async fn build_context(
        &self,
        options: &RequestOptions,
        key: QueryKey,
        request_timestamp: i64,
        abort: AbortController,
    ) -> Ctx {
        let inner = &self.inner;
        // Headers resolve before any middleware sees the request.
        let headers = options.headers.resolve().await;
        let request = TransportRequest {
            path: inner.spec.path.clone(),
            method: inner.spec.method,
            headers,
            query: options.query.clone(),
            params: options.params.clone(),
            body: options.body.clone(),
            cache: options.cache.clone(),
            signal: abort.signal(),
        };
        let ctx = inner.services.executor.create_context(ContextInput {
            operation: inner.operation,
            path: inner.spec.path.clone(),
            method: inner.spec.method,
            query_key: key,
            tags: inner.spec.tags.clone(),
            request_timestamp,
            instance_id: inner.instance_id,
            request,
            state: Arc::clone(&inner.services.state),
            events: Arc::clone(&inner.services.events),
            plugin_options: lock(&inner.plugin_options).clone(),
        });
        for entry in inner.metadata.iter() {
            ctx.set_temp(entry.key().clone(), entry.value().clone());
        }
        ctx
    }
}

impl std::fmt::Debug for OperationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationController")
            .field("operation", &self.inner.operation)
            .field("path", &self.inner.spec.path)
            .field("method", &self.inner.spec.method)
            .field("instance_id", &self.inner.instance_id)
            .finish()
    }
}

fn spawn_forced_execute(controller: OperationController) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(error) = controller.execute(None, true).await {
                    warn!(%error, "refetch execution failed");
                }
            });
        }
        Err(_) => warn!("refetch event outside a runtime; dropped"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
