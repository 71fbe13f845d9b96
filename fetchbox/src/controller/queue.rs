//! The bounded-concurrency FIFO queue controller.
//!
//! Write-style items enter the queue as `pending`, acquire a semaphore slot
//! in arrival order, run through the same middleware chain as a write, and
//! settle as `success`, `error`, or `aborted`. At any instant the number of
//! `running` items never exceeds the configured concurrency; the semaphore
//! is the authoritative bound.
//!
//! Settled items stay in the queue for inspection until removed; failed
//! items (`error` or `aborted`) can be retried with their original input.
//! With `auto_start` off, triggers enqueue but nothing dispatches until
//! `start` is called.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bounded_integer::bounded_integer;
use serde_json::{Value, json};
use smol_str::SmolStr;
use tokio::sync::watch;
use tracing::{debug, warn};

use fetchbox_core::{
    AbortController, AbortSignal, CachePatch, QueryKey, RequestOptions, Response, TransportRequest,
};

use crate::context::ContextInput;
use crate::error::Error;
use crate::events::Subscription;
use crate::plugin::{OperationType, PluginOptions};
use crate::semaphore::Semaphore;

use super::{OperationSpec, Services, core_fetch, next_instance_id, now_millis};

bounded_integer! {
    /// Queue concurrency limit (1-255).
    /// A value of 1 serializes the queue completely.
    #[repr(u8)]
    pub struct ConcurrencyLimit { 1..=255 }
}

/// Queue behavior configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// How many items may run at once.
    pub concurrency: ConcurrencyLimit,
    /// Whether triggers dispatch immediately or wait for `start`.
    pub auto_start: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            concurrency: ConcurrencyLimit::new_saturating(3),
            auto_start: true,
        }
    }
}

/// Declaration of a queue operation.
#[derive(Clone, Debug)]
pub struct QueueSpec {
    /// The underlying write operation (path, method, options, tags).
    pub base: OperationSpec,
    /// Queue behavior.
    pub config: QueueConfig,
}

/// Lifecycle status of one queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueItemStatus {
    /// Enqueued, no slot yet.
    Pending,
    /// Holding a slot, in flight.
    Running,
    /// Settled with data.
    Success,
    /// Settled with an error.
    Error,
    /// Settled by cancellation.
    Aborted,
}

impl QueueItemStatus {
    /// Returns the status as a string slice.
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            QueueItemStatus::Pending => "pending",
            QueueItemStatus::Running => "running",
            QueueItemStatus::Success => "success",
            QueueItemStatus::Error => "error",
            QueueItemStatus::Aborted => "aborted",
        }
    }

    /// Whether the item reached a terminal state.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            QueueItemStatus::Success | QueueItemStatus::Error | QueueItemStatus::Aborted
        )
    }

    /// Whether the item settled without success.
    pub fn is_failed(&self) -> bool {
        matches!(self, QueueItemStatus::Error | QueueItemStatus::Aborted)
    }
}

/// The caller-supplied payload of one trigger.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueueInput {
    /// Query-string parameters for this item.
    pub query: Option<Value>,
    /// Path parameters for this item.
    pub params: Option<Value>,
    /// Body for this item.
    pub body: Option<Value>,
    /// Opaque caller annotation carried on the item.
    pub meta: Option<Value>,
}

impl QueueInput {
    /// An input carrying only a body.
    pub fn body(body: Value) -> Self {
        QueueInput {
            body: Some(body),
            ..Default::default()
        }
    }

    fn as_options(&self) -> RequestOptions {
        RequestOptions {
            query: self.query.clone(),
            params: self.params.clone(),
            body: self.body.clone(),
            ..Default::default()
        }
    }
}

/// Public snapshot of one queue item.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueItem {
    /// Item id, user-supplied or generated.
    pub id: SmolStr,
    /// Lifecycle status.
    pub status: QueueItemStatus,
    /// The original trigger input.
    pub input: QueueInput,
    /// Response data once settled successfully.
    pub data: Option<Value>,
    /// Error payload once settled in failure.
    pub error: Option<Value>,
    /// Caller annotation.
    pub meta: Option<Value>,
}

/// Aggregate queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items waiting for a slot.
    pub pending: usize,
    /// Items holding a slot.
    pub running: usize,
    /// `success + failed`.
    pub settled: usize,
    /// Items settled successfully.
    pub success: usize,
    /// `error + aborted`.
    pub failed: usize,
    /// Every item in the queue.
    pub total: usize,
    /// `floor(100 * settled / total)`, `0` when the queue is empty.
    pub percentage: u8,
}

struct ItemRecord {
    id: SmolStr,
    status: QueueItemStatus,
    input: QueueInput,
    data: Option<Value>,
    error: Option<Value>,
    meta: Option<Value>,
    abort: AbortController,
}

impl ItemRecord {
    fn snapshot(&self) -> QueueItem {
        QueueItem {
            id: self.id.clone(),
            status: self.status,
            input: self.input.clone(),
            data: self.data.clone(),
            error: self.error.clone(),
            meta: self.meta.clone(),
        }
    }
}

struct QueueInner {
    spec: QueueSpec,
    services: Services,
    instance_id: u64,
    semaphore: Semaphore,
    items: Mutex<Vec<ItemRecord>>,
    subscribers: Mutex<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>,
    next_sub_id: AtomicU64,
    id_counter: AtomicU64,
    started: watch::Sender<bool>,
    plugin_options: Mutex<PluginOptions>,
}

/// Controller for a bounded-concurrency FIFO of write-style items.
#[derive(Clone)]
pub struct QueueController {
    inner: Arc<QueueInner>,
}

impl QueueController {
    pub(crate) fn new(spec: QueueSpec, services: Services) -> Self {
        let concurrency = spec.config.concurrency.get() as usize;
        let (started, _) = watch::channel(spec.config.auto_start);
        let plugin_options = spec.base.plugin_options.clone();
        QueueController {
            inner: Arc::new(QueueInner {
                spec,
                services,
                instance_id: next_instance_id(),
                semaphore: Semaphore::new(concurrency),
                items: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                next_sub_id: AtomicU64::new(0),
                id_counter: AtomicU64::new(0),
                started,
                plugin_options: Mutex::new(plugin_options),
            }),
        }
    }

    /// Enqueues an item with a generated id and resolves with its response
    /// (or the aborted response).
    pub async fn trigger(&self, input: QueueInput) -> Result<Response, Error> {
        let id = self.generate_id();
        self.trigger_as(id, input).await
    }

    /// Enqueues an item under a caller-chosen id.
    pub async fn trigger_with_id(
        &self,
        id: impl Into<SmolStr>,
        input: QueueInput,
    ) -> Result<Response, Error> {
        self.trigger_as(id.into(), input).await
    }

    /// Snapshot of every item in insertion order.
    pub fn get_queue(&self) -> Vec<QueueItem> {
        lock(&self.inner.items)
            .iter()
            .map(ItemRecord::snapshot)
            .collect()
    }

    /// Aggregate counters.
    pub fn get_stats(&self) -> QueueStats {
        let items = lock(&self.inner.items);
        let mut stats = QueueStats {
            total: items.len(),
            ..Default::default()
        };
        for item in items.iter() {
            match item.status {
                QueueItemStatus::Pending => stats.pending += 1,
                QueueItemStatus::Running => stats.running += 1,
                QueueItemStatus::Success => stats.success += 1,
                QueueItemStatus::Error | QueueItemStatus::Aborted => stats.failed += 1,
            }
        }
        stats.settled = stats.success + stats.failed;
        stats.percentage = if stats.total == 0 {
            0
        } else {
            (100 * stats.settled / stats.total) as u8
        };
        stats
    }

    /// Registers a callback fired on every queue mutation.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        let inner = &self.inner;
        let id = inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        lock(&inner.subscribers).push((id, Arc::new(callback)));

        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner.subscribers).retain(|(subscriber_id, _)| *subscriber_id != id);
            }
        })
    }

    /// Aborts one item by id, or every non-settled item without an id.
    ///
    /// Pending items settle as `aborted` immediately and their trigger
    /// resolves with the aborted response; running items are signalled and
    /// settle when the transport call returns.
    pub fn abort(&self, id: Option<&str>) {
        {
            let mut items = lock(&self.inner.items);
            for item in items.iter_mut() {
                if let Some(id) = id
                    && item.id != id
                {
                    continue;
                }
                match item.status {
                    QueueItemStatus::Pending => {
                        item.status = QueueItemStatus::Aborted;
                        item.abort.abort();
                    }
                    QueueItemStatus::Running => item.abort.abort(),
                    _ => {}
                }
            }
        }
        self.notify();
    }

    /// Re-enqueues one failed item by id, or every failed item without an
    /// id, preserving the original input.
    pub fn retry(&self, id: Option<&str>) {
        let ids: Vec<SmolStr> = {
            let mut items = lock(&self.inner.items);
            items
                .iter_mut()
                .filter(|item| item.status.is_failed() && id.is_none_or(|id| item.id == id))
                .map(|item| {
                    item.status = QueueItemStatus::Pending;
                    item.data = None;
                    item.error = None;
                    item.abort = AbortController::new();
                    item.id.clone()
                })
                .collect()
        };
        if ids.is_empty() {
            return;
        }
        self.notify();
        for id in ids {
            let controller = self.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(error) = controller.run_item(id).await {
                            warn!(%error, "queue retry failed");
                        }
                    });
                }
                Err(_) => warn!("retry outside a runtime; dropped"),
            }
        }
    }

    /// Removes one item by id (aborting it first if active), or every
    /// settled item without an id.
    pub fn remove(&self, id: Option<&str>) {
        {
            let mut items = lock(&self.inner.items);
            match id {
                Some(id) => {
                    if let Some(index) = items.iter().position(|item| item.id == id) {
                        if !items[index].status.is_settled() {
                            items[index].abort.abort();
                        }
                        items.remove(index);
                    }
                }
                None => items.retain(|item| !item.status.is_settled()),
            }
        }
        self.notify();
    }

    /// Removes every settled item.
    pub fn remove_settled(&self) {
        self.remove(None);
    }

    /// Aborts everything and empties the queue.
    pub fn clear(&self) {
        {
            let mut items = lock(&self.inner.items);
            for item in items.iter() {
                if !item.status.is_settled() {
                    item.abort.abort();
                }
            }
            items.clear();
        }
        self.inner.semaphore.reset();
        self.notify();
    }

    /// Re-configures the concurrency limit. Growing releases waiters up to
    /// the delta.
    pub fn set_concurrency(&self, concurrency: ConcurrencyLimit) {
        self.inner.semaphore.set_concurrency(concurrency.get() as usize);
    }

    /// Releases held triggers when the queue was created with
    /// `auto_start: false`.
    pub fn start(&self) {
        // send_replace applies even when no trigger is currently parked.
        self.inner.started.send_replace(true);
    }

    /// Whether triggers currently dispatch.
    pub fn is_started(&self) -> bool {
        *self.inner.started.borrow()
    }

    async fn trigger_as(&self, id: SmolStr, input: QueueInput) -> Result<Response, Error> {
        {
            let meta = input.meta.clone();
            lock(&self.inner.items).push(ItemRecord {
                id: id.clone(),
                status: QueueItemStatus::Pending,
                input,
                data: None,
                error: None,
                meta,
                abort: AbortController::new(),
            });
        }
        debug!(%id, "queue item enqueued");
        self.notify();
        self.run_item(id).await
    }

    async fn run_item(&self, id: SmolStr) -> Result<Response, Error> {
        let inner = &self.inner;
        let Some((signal, input)) = ({
            let items = lock(&inner.items);
            items
                .iter()
                .find(|item| item.id == id)
                .map(|item| (item.abort.signal(), item.input.clone()))
        }) else {
            return Ok(Response::aborted());
        };

        // Hold until started, unless aborted while parked.
        if !self.is_started() {
            let mut started = inner.started.subscribe();
            tokio::select! {
                outcome = started.wait_for(|started| *started) => {
                    if outcome.is_err() {
                        return Ok(self.settle_aborted(&id));
                    }
                }
                _ = signal.cancelled() => return Ok(self.settle_aborted(&id)),
            }
        }
        if signal.is_aborted() || self.status_of(&id) == Some(QueueItemStatus::Aborted) {
            return Ok(self.settle_aborted(&id));
        }

        // FIFO slot acquisition, abortable while parked.
        let acquired = tokio::select! {
            acquired = inner.semaphore.acquire() => acquired,
            _ = signal.cancelled() => return Ok(self.settle_aborted(&id)),
        };
        if !acquired {
            return Ok(self.settle_aborted(&id));
        }
        if signal.is_aborted() {
            inner.semaphore.release();
            return Ok(self.settle_aborted(&id));
        }

        self.set_status(&id, QueueItemStatus::Running);
        self.notify();

        let result = self.dispatch(&input, signal).await;
        inner.semaphore.release();

        match result {
            Ok(response) => {
                {
                    let mut items = lock(&inner.items);
                    if let Some(item) = items.iter_mut().find(|item| item.id == id) {
                        if response.aborted {
                            item.status = QueueItemStatus::Aborted;
                        } else if let Some(error) = &response.error {
                            item.status = QueueItemStatus::Error;
                            item.error = Some(error.clone());
                        } else {
                            item.status = QueueItemStatus::Success;
                            item.data = response.data.clone();
                        }
                        #[cfg(feature = "metrics")]
                        metrics::counter!(
                            *crate::metrics::QUEUE_SETTLED_COUNTER,
                            "status" => item.status.as_str()
                        )
                        .increment(1);
                    }
                }
                self.notify();
                Ok(response)
            }
            Err(error) => {
                {
                    let mut items = lock(&inner.items);
                    if let Some(item) = items.iter_mut().find(|item| item.id == id) {
                        item.status = QueueItemStatus::Error;
                        item.error = Some(json!(error.to_string()));
                    }
                }
                self.notify();
                Err(error)
            }
        }
    }

    async fn dispatch(&self, input: &QueueInput, signal: AbortSignal) -> Result<Response, Error> {
        let inner = &self.inner;
        let merged = inner.spec.base.options.merged_with(&input.as_options());
        let key = QueryKey::for_request(&inner.spec.base.path, inner.spec.base.method, &merged);
        let headers = merged.headers.resolve().await;
        let request = TransportRequest {
            path: inner.spec.base.path.clone(),
            method: inner.spec.base.method,
            headers,
            query: merged.query.clone(),
            params: merged.params.clone(),
            body: merged.body.clone(),
            cache: merged.cache.clone(),
            signal,
        };
        let ctx = inner.services.executor.create_context(ContextInput {
            operation: OperationType::Queue,
            path: inner.spec.base.path.clone(),
            method: inner.spec.base.method,
            query_key: key.clone(),
            tags: inner.spec.base.tags.clone(),
            request_timestamp: now_millis(),
            instance_id: inner.instance_id,
            request,
            state: Arc::clone(&inner.services.state),
            events: Arc::clone(&inner.services.events),
            plugin_options: lock(&inner.plugin_options).clone(),
        });

        let core = core_fetch(Arc::clone(&inner.services.transport), false);
        let response = inner
            .services
            .executor
            .execute_middleware(OperationType::Queue, &ctx, &core)
            .await?;

        if response.is_success()
            && let Some(data) = response.data.clone()
        {
            inner.services.state.set_cache(
                &key,
                CachePatch::commit(data, now_millis()).tags(inner.spec.base.tags.clone()),
            );
        }
        Ok(response)
    }

    fn settle_aborted(&self, id: &str) -> Response {
        {
            let mut items = lock(&self.inner.items);
            if let Some(item) = items.iter_mut().find(|item| item.id == id)
                && !item.status.is_settled()
            {
                item.status = QueueItemStatus::Aborted;
            }
        }
        self.notify();
        Response::aborted()
    }

    fn status_of(&self, id: &str) -> Option<QueueItemStatus> {
        lock(&self.inner.items)
            .iter()
            .find(|item| item.id == id)
            .map(|item| item.status)
    }

    fn set_status(&self, id: &str, status: QueueItemStatus) {
        let mut items = lock(&self.inner.items);
        if let Some(item) = items.iter_mut().find(|item| item.id == id) {
            item.status = status;
        }
    }

    fn generate_id(&self) -> SmolStr {
        let sequence = self.inner.id_counter.fetch_add(1, Ordering::Relaxed);
        SmolStr::new(format!("q-{}-{}", now_millis(), sequence))
    }

    fn notify(&self) {
        let subscribers: Vec<Arc<dyn Fn() + Send + Sync>> = lock(&self.inner.subscribers)
            .iter()
            .map(|(_, subscriber)| Arc::clone(subscriber))
            .collect();
        for subscriber in subscribers {
            subscriber();
        }
    }
}

impl std::fmt::Debug for QueueController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueController")
            .field("path", &self.inner.spec.base.path)
            .field("stats", &self.get_stats())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
