//! The paginated composite controller.
//!
//! An [`InfiniteController`] owns an ordered list of page keys plus the
//! request that fetched each page. Every page is an independent cache entry
//! keyed by `{path, method, baseOptions, pageRequest}`, so pages can be
//! invalidated individually or as a set through shared tags. The ordered
//! list itself is mirrored into a dedicated tracker cache entry (its key is
//! marked `type: "infinite-tracker"`), which is how paging state survives
//! unmount/remount within the process.
//!
//! User-supplied callbacks decide paging: `can_fetch_next` inspects the
//! boundary page's response, `next_page_request` computes the next request,
//! and `merger` folds all page responses, in reading order, into the
//! composite data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use fetchbox_core::{
    AbortController, CacheEntry, CachePatch, QueryKey, RequestOptions, Response, TransportRequest,
};

use crate::context::{ContextInput, Ctx};
use crate::error::Error;
use crate::events::{Event, Subscription, topic};
use crate::executor::LifecyclePhase;
use crate::plugin::{OperationType, PluginOptions};

use super::{OperationSpec, Services, core_fetch, next_instance_id, now_millis};

/// Which edge a page fetch is extending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    /// Appending after the last page.
    Next,
    /// Prepending before the first page.
    Prev,
}

/// The request that fetched (or will fetch) one page.
///
/// Overlaid on the operation's base options to form the actual request;
/// also persisted in the tracker entry so refetches can replay it.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PageRequest {
    /// Query-string parameters for this page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
    /// Path parameters for this page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Body for this page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl PageRequest {
    /// A page request carrying only query parameters.
    pub fn query(query: Value) -> Self {
        PageRequest {
            query: Some(query),
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

/// What paging callbacks see: the boundary page and everything loaded.
///
/// For forward paging the boundary is the last page in reading order; for
/// backward paging it is the first.
pub struct InfiniteView {
    /// The request that fetched the boundary page.
    pub page_request: PageRequest,
    /// The boundary page's response.
    pub page_response: Response,
    /// Every loaded page's response, in reading order.
    pub all_responses: Vec<Response>,
}

type CanFetchFn = dyn Fn(&InfiniteView) -> bool + Send + Sync;
type PageRequestFn = dyn Fn(&InfiniteView) -> Option<PageRequest> + Send + Sync;
type MergerFn = dyn Fn(&[Response]) -> Value + Send + Sync;

/// User-supplied paging callbacks.
#[derive(Clone)]
pub struct InfinitePaging {
    can_fetch_next: Arc<CanFetchFn>,
    next_page_request: Arc<PageRequestFn>,
    can_fetch_prev: Option<Arc<CanFetchFn>>,
    prev_page_request: Option<Arc<PageRequestFn>>,
    merger: Arc<MergerFn>,
}

impl InfinitePaging {
    /// Declares forward paging with a merger.
    pub fn new(
        can_fetch_next: impl Fn(&InfiniteView) -> bool + Send + Sync + 'static,
        next_page_request: impl Fn(&InfiniteView) -> Option<PageRequest> + Send + Sync + 'static,
        merger: impl Fn(&[Response]) -> Value + Send + Sync + 'static,
    ) -> Self {
        InfinitePaging {
            can_fetch_next: Arc::new(can_fetch_next),
            next_page_request: Arc::new(next_page_request),
            can_fetch_prev: None,
            prev_page_request: None,
            merger: Arc::new(merger),
        }
    }

    /// Adds backward paging.
    pub fn with_prev(
        mut self,
        can_fetch_prev: impl Fn(&InfiniteView) -> bool + Send + Sync + 'static,
        prev_page_request: impl Fn(&InfiniteView) -> Option<PageRequest> + Send + Sync + 'static,
    ) -> Self {
        self.can_fetch_prev = Some(Arc::new(can_fetch_prev));
        self.prev_page_request = Some(Arc::new(prev_page_request));
        self
    }
}

impl std::fmt::Debug for InfinitePaging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfinitePaging")
            .field("bidirectional", &self.can_fetch_prev.is_some())
            .finish()
    }
}

/// Declaration of an infinite read operation.
#[derive(Clone, Debug)]
pub struct InfiniteSpec {
    /// The underlying operation (path, method, options, tags).
    pub base: OperationSpec,
    /// Paging callbacks.
    pub paging: InfinitePaging,
}

/// The composite state exposed to adapters.
#[derive(Debug)]
pub struct InfiniteState {
    /// Merged data from every loaded page, or `None` before the first load.
    pub data: Option<Value>,
    /// The most recent page error, if any.
    pub error: Option<Value>,
    /// Whether a forward page fetch would dispatch.
    pub can_fetch_next: bool,
    /// Whether a backward page fetch would dispatch.
    pub can_fetch_prev: bool,
    /// Every loaded page's response, in reading order.
    pub all_responses: Vec<Response>,
    /// Every loaded page's request, in reading order.
    pub all_requests: Vec<PageRequest>,
}

#[derive(Default)]
struct Pages {
    keys: Vec<QueryKey>,
    requests: HashMap<QueryKey, PageRequest>,
}

#[derive(Debug, Clone, Copy)]
enum Edge {
    First,
    Last,
}

struct InfiniteInner {
    spec: InfiniteSpec,
    services: Services,
    instance_id: u64,
    tracker_key: QueryKey,
    plugin_options: Mutex<PluginOptions>,
    pages: Mutex<Pages>,
    direction: Mutex<Option<FetchDirection>>,
    last_error: Mutex<Option<Value>>,
    abort: Mutex<Option<AbortController>>,
    mounted: AtomicBool,
    page_subs: Mutex<Vec<Subscription>>,
    listeners: Mutex<Vec<Subscription>>,
    subscribers: Mutex<Vec<(u64, Arc<dyn Fn() + Send + Sync>)>>,
    next_sub_id: AtomicU64,
}

/// Controller for a paginated composite of reads.
#[derive(Clone)]
pub struct InfiniteController {
    inner: Arc<InfiniteInner>,
}

impl InfiniteController {
    pub(crate) fn new(spec: InfiniteSpec, services: Services) -> Self {
        let tracker_key =
            QueryKey::for_tracker(&spec.base.path, spec.base.method, &spec.base.options);
        let plugin_options = spec.base.plugin_options.clone();
        InfiniteController {
            inner: Arc::new(InfiniteInner {
                spec,
                services,
                instance_id: next_instance_id(),
                tracker_key,
                plugin_options: Mutex::new(plugin_options),
                pages: Mutex::new(Pages::default()),
                direction: Mutex::new(None),
                last_error: Mutex::new(None),
                abort: Mutex::new(None),
                mounted: AtomicBool::new(false),
                page_subs: Mutex::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                subscribers: Mutex::new(Vec::new()),
                next_sub_id: AtomicU64::new(0),
            }),
        }
    }

    /// The tracker entry's key.
    pub fn tracker_key(&self) -> &QueryKey {
        &self.inner.tracker_key
    }

    /// Fetches the next page (or the first, when nothing is loaded yet).
    ///
    /// No-op returning `Ok(None)` when the paging callbacks decline or the
    /// page is already in flight.
    pub async fn fetch_next(&self) -> Result<Option<Response>, Error> {
        let page_request = {
            let pages = lock(&self.inner.pages);
            if pages.keys.is_empty() {
                Some(PageRequest::default())
            } else {
                let view = self.view(&pages, Edge::Last);
                if (self.inner.spec.paging.can_fetch_next)(&view) {
                    (self.inner.spec.paging.next_page_request)(&view)
                } else {
                    None
                }
            }
        };
        match page_request {
            Some(request) => self.fetch_page(request, FetchDirection::Next).await,
            None => Ok(None),
        }
    }

    /// Fetches the page before the first one. No-op unless backward paging
    /// callbacks were supplied and at least one page is loaded.
    pub async fn fetch_prev(&self) -> Result<Option<Response>, Error> {
        let paging = &self.inner.spec.paging;
        let (Some(can_fetch_prev), Some(prev_page_request)) =
            (&paging.can_fetch_prev, &paging.prev_page_request)
        else {
            return Ok(None);
        };
        let page_request = {
            let pages = lock(&self.inner.pages);
            if pages.keys.is_empty() {
                None
            } else {
                let view = self.view(&pages, Edge::First);
                if can_fetch_prev(&view) {
                    prev_page_request(&view)
                } else {
                    None
                }
            }
        };
        match page_request {
            Some(request) => self.fetch_page(request, FetchDirection::Prev).await,
            None => Ok(None),
        }
    }

    /// Deletes every page entry and the tracker, then fetches a fresh
    /// first page.
    pub async fn refetch(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let keys = {
            let mut pages = lock(&inner.pages);
            pages.requests.clear();
            std::mem::take(&mut pages.keys)
        };
        for subscription in lock(&inner.page_subs).drain(..) {
            subscription.unsubscribe();
        }
        for key in &keys {
            inner.services.state.delete_cache(key);
        }
        inner.services.state.delete_cache(&inner.tracker_key);
        *lock(&inner.last_error) = None;
        self.notify();

        self.fetch_next().await?;
        Ok(())
    }

    /// Aborts the page fetch currently in flight, if any.
    pub fn abort(&self) {
        if let Some(abort) = lock(&self.inner.abort).take() {
            abort.abort();
        }
    }

    /// The merged composite state.
    pub fn get_state(&self) -> InfiniteState {
        let inner = &self.inner;
        let pages = lock(&inner.pages);
        let responses = self.page_responses(&pages);
        let requests: Vec<PageRequest> = pages
            .keys
            .iter()
            .map(|key| pages.requests.get(key).cloned().unwrap_or_default())
            .collect();

        let can_fetch_next = if pages.keys.is_empty() {
            true
        } else {
            (inner.spec.paging.can_fetch_next)(&self.view(&pages, Edge::Last))
        };
        let can_fetch_prev = match &inner.spec.paging.can_fetch_prev {
            Some(can_fetch_prev) if !pages.keys.is_empty() => {
                can_fetch_prev(&self.view(&pages, Edge::First))
            }
            _ => false,
        };

        InfiniteState {
            data: (!responses.is_empty()).then(|| (inner.spec.paging.merger)(&responses)),
            error: lock(&inner.last_error).clone(),
            can_fetch_next,
            can_fetch_prev,
            all_responses: responses,
            all_requests: requests,
        }
    }

    /// The direction of the page fetch in flight, if any.
    pub fn get_fetching_direction(&self) -> Option<FetchDirection> {
        *lock(&self.inner.direction)
    }

    /// Registers a callback fired on any change to the composite (page
    /// data, page set, errors).
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

    /// Drives plugin `on_mount` hooks, restores the tracker, and starts
    /// listening for refetch events addressed to the tracker or any page.
    /// If anything restored is already stale, refetches immediately.
    pub async fn mount(&self) -> Result<(), Error> {
        let inner = &self.inner;
        inner.mounted.store(true, Ordering::SeqCst);

        let ctx = self.get_context().await;
        inner
            .services
            .executor
            .execute_lifecycle(LifecyclePhase::Mount, OperationType::InfiniteRead, &ctx)
            .await?;

        self.restore_tracker();
        let keys = lock(&inner.pages).keys.clone();
        for key in &keys {
            self.subscribe_page(key);
        }

        let weak = Arc::downgrade(&self.inner);
        let listener = inner.services.events.subscribe(topic::REFETCH, move |event| {
            if let Event::Refetch(refetch) = event
                && let Some(inner) = weak.upgrade()
            {
                let owned = inner.tracker_key == refetch.query_key
                    || lock(&inner.pages).keys.contains(&refetch.query_key);
                if owned {
                    debug!(reason = refetch.reason.as_str(), "infinite refetch event owned");
                    spawn_refetch(InfiniteController { inner });
                }
            }
        });
        *lock(&inner.listeners) = vec![listener];

        let stale = self.any_stale(&keys);
        if stale {
            self.refetch().await?;
        }
        Ok(())
    }

    /// Drives plugin `on_unmount` hooks and removes every subscription the
    /// controller holds.
    pub async fn unmount(&self) -> Result<(), Error> {
        let inner = &self.inner;
        inner.mounted.store(false, Ordering::SeqCst);
        for subscription in lock(&inner.page_subs).drain(..) {
            subscription.unsubscribe();
        }
        for listener in lock(&inner.listeners).drain(..) {
            listener.unsubscribe();
        }
        let ctx = self.get_context().await;
        inner
            .services
            .executor
            .execute_lifecycle(LifecyclePhase::Unmount, OperationType::InfiniteRead, &ctx)
            .await
    }

    /// Builds a fresh context keyed by the tracker, for lifecycle
    /// bookkeeping.
    pub async fn get_context(&self) -> Ctx {
        let inner = &self.inner;
        let options = inner.spec.base.options.clone();
        let headers = options.headers.resolve().await;
        let request = TransportRequest {
            path: inner.spec.base.path.clone(),
            method: inner.spec.base.method,
            headers,
            query: options.query.clone(),
            params: options.params.clone(),
            body: options.body.clone(),
            cache: options.cache.clone(),
            signal: fetchbox_core::AbortSignal::never(),
        };
        inner.services.executor.create_context(ContextInput {
            operation: OperationType::InfiniteRead,
            path: inner.spec.base.path.clone(),
            method: inner.spec.base.method,
            query_key: inner.tracker_key.clone(),
            tags: inner.spec.base.tags.clone(),
            request_timestamp: now_millis(),
            instance_id: inner.instance_id,
            request,
            state: Arc::clone(&inner.services.state),
            events: Arc::clone(&inner.services.events),
            plugin_options: lock(&inner.plugin_options).clone(),
        })
    }

    /// Replaces the plugin options used by subsequent page fetches.
    pub fn set_plugin_options(&self, plugin_options: PluginOptions) {
        *lock(&self.inner.plugin_options) = plugin_options;
    }

    async fn fetch_page(
        &self,
        page_request: PageRequest,
        direction: FetchDirection,
    ) -> Result<Option<Response>, Error> {
        let inner = &self.inner;
        let merged = inner.spec.base.options.merged_with(&page_request.as_options());
        let key = QueryKey::for_request(&inner.spec.base.path, inner.spec.base.method, &merged);

        // Page dedup: an in-flight fetch for this page key wins.
        if inner.services.state.get_pending(&key).is_some() {
            debug!(key = %key, "page already in flight");
            return Ok(None);
        }

        *lock(&inner.direction) = Some(direction);
        let abort = AbortController::new();
        *lock(&inner.abort) = Some(abort.clone());

        let headers = merged.headers.resolve().await;
        let request = TransportRequest {
            path: inner.spec.base.path.clone(),
            method: inner.spec.base.method,
            headers,
            query: merged.query.clone(),
            params: merged.params.clone(),
            body: merged.body.clone(),
            cache: merged.cache.clone(),
            signal: abort.signal(),
        };
        let ctx = inner.services.executor.create_context(ContextInput {
            operation: OperationType::InfiniteRead,
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

        let core = core_fetch(Arc::clone(&inner.services.transport), true);
        let result = inner
            .services
            .executor
            .execute_middleware(OperationType::InfiniteRead, &ctx, &core)
            .await;
        *lock(&inner.direction) = None;
        let response = result?;

        if response.is_success()
            && let Some(data) = response.data.clone()
        {
            inner.services.state.set_cache(
                &key,
                CachePatch::commit(data, now_millis()).tags(inner.spec.base.tags.clone()),
            );
            {
                let mut pages = lock(&inner.pages);
                if !pages.keys.contains(&key) {
                    match direction {
                        FetchDirection::Next => pages.keys.push(key.clone()),
                        FetchDirection::Prev => pages.keys.insert(0, key.clone()),
                    }
                }
                pages.requests.insert(key.clone(), page_request);
            }
            self.mirror_tracker();
            if inner.mounted.load(Ordering::SeqCst) {
                self.subscribe_page(&key);
            }
            *lock(&inner.last_error) = None;
        } else if let Some(error) = &response.error {
            *lock(&inner.last_error) = Some(error.clone());
        }
        self.notify();
        Ok(Some(response))
    }

    /// Writes the page list into the tracker entry so paging state
    /// survives remount.
    fn mirror_tracker(&self) {
        let inner = &self.inner;
        let pages = lock(&inner.pages);
        let page_keys: Vec<Value> = pages
            .keys
            .iter()
            .map(|key| Value::String(key.as_str().to_owned()))
            .collect();
        let mut page_requests = Map::new();
        for (key, request) in &pages.requests {
            if let Ok(encoded) = serde_json::to_value(request) {
                page_requests.insert(key.as_str().to_owned(), encoded);
            }
        }
        drop(pages);
        inner.services.state.set_cache(
            &inner.tracker_key,
            CachePatch::commit(
                json!({"pageKeys": page_keys, "pageRequests": page_requests}),
                now_millis(),
            )
            .tags(inner.spec.base.tags.clone()),
        );
    }

    /// Rebuilds the page list from the tracker entry, if the controller
    /// has none and a tracker survives from an earlier mount.
    fn restore_tracker(&self) {
        let inner = &self.inner;
        if !lock(&inner.pages).keys.is_empty() {
            return;
        }
        let Some(entry) = inner.services.state.get_cache(&inner.tracker_key) else {
            return;
        };
        let Some(data) = entry.state.data else {
            return;
        };
        let Some(keys) = data.get("pageKeys").and_then(Value::as_array) else {
            return;
        };
        let mut pages = lock(&inner.pages);
        for raw in keys {
            let Some(raw) = raw.as_str() else { continue };
            let key = QueryKey::from_raw(raw);
            let request = data
                .get("pageRequests")
                .and_then(|requests| requests.get(raw))
                .and_then(|encoded| serde_json::from_value(encoded.clone()).ok())
                .unwrap_or_default();
            pages.requests.insert(key.clone(), request);
            pages.keys.push(key);
        }
        debug!(pages = pages.keys.len(), "tracker restored");
    }

    fn subscribe_page(&self, key: &QueryKey) {
        let weak = Arc::downgrade(&self.inner);
        let subscription = self.inner.services.state.subscribe_cache(key, move || {
            if let Some(inner) = weak.upgrade() {
                InfiniteController { inner }.notify();
            }
        });
        lock(&self.inner.page_subs).push(subscription);
    }

    fn any_stale(&self, keys: &[QueryKey]) -> bool {
        let state = &self.inner.services.state;
        let stale_entry =
            |entry: Option<CacheEntry>| entry.map(|entry| entry.stale).unwrap_or(false);
        stale_entry(state.get_cache(&self.inner.tracker_key))
            || keys.iter().any(|key| stale_entry(state.get_cache(key)))
    }

    fn page_responses(&self, pages: &Pages) -> Vec<Response> {
        pages
            .keys
            .iter()
            .map(|key| {
                self.inner
                    .services
                    .state
                    .get_cache(key)
                    .map(entry_response)
                    .unwrap_or_else(Response::empty)
            })
            .collect()
    }

    fn view(&self, pages: &Pages, edge: Edge) -> InfiniteView {
        let all_responses = self.page_responses(pages);
        let index = match edge {
            Edge::First => 0,
            Edge::Last => all_responses.len().saturating_sub(1),
        };
        let boundary_key = pages.keys.get(index);
        InfiniteView {
            page_request: boundary_key
                .and_then(|key| pages.requests.get(key).cloned())
                .unwrap_or_default(),
            page_response: all_responses.get(index).cloned().unwrap_or_default(),
            all_responses,
        }
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

impl std::fmt::Debug for InfiniteController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteController")
            .field("path", &self.inner.spec.base.path)
            .field("pages", &lock(&self.inner.pages).keys.len())
            .finish()
    }
}

fn entry_response(entry: CacheEntry) -> Response {
    Response {
        status: if entry.state.data.is_some() { 200 } else { 0 },
        data: entry.state.data,
        error: entry.state.error,
        headers: None,
        aborted: false,
    }
}

fn spawn_refetch(controller: InfiniteController) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(error) = controller.refetch().await {
                    warn!(%error, "infinite refetch failed");
                }
            });
        }
        Err(_) => warn!("refetch event outside a runtime; dropped"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
