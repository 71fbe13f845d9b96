//! Optimistic updates for writes.
//!
//! Before the write dispatches, each declared target selects cache entries
//! by exact path (self-tag), method, and an optional predicate over the
//! request decoded from the entry's key. Selected entries are snapshotted
//! into `previous_data`, rewritten provisionally with
//! `updater(current, None)`, and stamped `meta.isOptimistic`. The snapshot
//! lives in the cache entry itself, so a crash between apply and
//! settlement leaves enough state to roll back from.
//!
//! On failure (error response, abort, or middleware error) targets with
//! rollback enabled restore their snapshots; on success the snapshots are
//! discarded and `on_success` targets re-apply with the real response
//! data, reconciling the provisional value with what the server returned.
//!
//! Auto-invalidation is suppressed for the write, via the invalidation
//! plugin's exported handle, so the mutation does not immediately mark
//! stale the very caches just updated.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use smol_str::SmolStr;
use tracing::debug;

use fetchbox_core::{CachePatch, DecodedKey, Method, MetaMap, PatchOp, QueryKey, Response, StatePatch};

use crate::context::Ctx;
use crate::error::Error;
use crate::executor::Next;
use crate::plugin::{OperationType, Plugin};

use super::invalidation::{self, InvalidationHandle, InvalidationMode};

/// Registered name of the optimistic plugin.
pub const NAME: &str = "fetchbox:optimistic";

/// Meta key stamped on provisionally updated entries.
pub const META_KEY: &str = "isOptimistic";

type UpdaterFn = dyn Fn(Option<&Value>, Option<&Value>) -> Value + Send + Sync;
type FilterFn = dyn Fn(&DecodedKey) -> bool + Send + Sync;
type ErrorHookFn = dyn Fn(Option<&Value>) + Send + Sync;

/// One cache target of an optimistic write, built fluently:
///
/// ```
/// use fetchbox::plugins::OptimisticTarget;
/// use serde_json::json;
///
/// let target = OptimisticTarget::get("/posts")
///     .filter(|request| request.query().is_none())
///     .update_cache(|current, _response| match current {
///         Some(serde_json::Value::Array(posts)) => json!(
///             posts.iter().filter(|post| post["id"] != json!(1)).collect::<Vec<_>>()
///         ),
///         other => other.cloned().unwrap_or(serde_json::Value::Null),
///     })
///     .no_rollback();
/// ```
#[derive(Clone)]
pub struct OptimisticTarget {
    path: SmolStr,
    method: Method,
    filter: Option<Arc<FilterFn>>,
    updater: Option<Arc<UpdaterFn>>,
    apply_on_success: bool,
    rollback_on_error: bool,
    on_error: Option<Arc<ErrorHookFn>>,
}

impl OptimisticTarget {
    /// Targets entries of the given method and path.
    pub fn new(method: Method, path: impl Into<SmolStr>) -> Self {
        OptimisticTarget {
            path: path.into(),
            method,
            filter: None,
            updater: None,
            apply_on_success: false,
            rollback_on_error: true,
            on_error: None,
        }
    }

    /// Targets GET entries of the given path.
    pub fn get(path: impl Into<SmolStr>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Narrows selection with a predicate over the request decoded from
    /// each candidate entry's key.
    pub fn filter(mut self, filter: impl Fn(&DecodedKey) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Sets the updater. Called with `(current, None)` when applying
    /// provisionally and `(current, Some(response_data))` when re-applying
    /// on success.
    pub fn update_cache(
        mut self,
        updater: impl Fn(Option<&Value>, Option<&Value>) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.updater = Some(Arc::new(updater));
        self
    }

    /// Re-applies the updater with the response data after a successful
    /// write.
    pub fn on_success(mut self) -> Self {
        self.apply_on_success = true;
        self
    }

    /// Keeps the provisional data on failure instead of restoring the
    /// snapshot.
    pub fn no_rollback(mut self) -> Self {
        self.rollback_on_error = false;
        self
    }

    /// Invoked with the error payload when the write fails.
    pub fn on_error(mut self, hook: impl Fn(Option<&Value>) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for OptimisticTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticTarget")
            .field("path", &self.path)
            .field("method", &self.method)
            .field("filtered", &self.filter.is_some())
            .field("apply_on_success", &self.apply_on_success)
            .field("rollback_on_error", &self.rollback_on_error)
            .finish()
    }
}

struct Applied {
    key: QueryKey,
    snapshot: Option<Value>,
    target: OptimisticTarget,
}

/// Snapshot, provisional write, confirm-or-rollback.
#[derive(Debug, Default)]
pub struct OptimisticPlugin;

impl OptimisticPlugin {
    /// Creates the plugin.
    pub fn new() -> Self {
        Self
    }

    fn apply_targets(ctx: &Ctx, targets: &[OptimisticTarget]) -> Vec<Applied> {
        let state = ctx.state();
        let mut applied = Vec::new();
        for target in targets {
            let Some(updater) = &target.updater else {
                continue;
            };
            for (key, entry) in state.get_cache_entries_by_self_tag(&target.path) {
                let Some(decoded) = key.parse() else { continue };
                if decoded.method != target.method || decoded.is_tracker {
                    continue;
                }
                if let Some(filter) = &target.filter
                    && !filter(&decoded)
                {
                    continue;
                }
                let snapshot = entry.state.data.clone();
                let provisional = updater(snapshot.as_ref(), None);
                state.set_cache(
                    &key,
                    CachePatch {
                        state: Some(StatePatch::data(provisional)),
                        previous_data: PatchOp::Set(snapshot.clone()),
                        ..Default::default()
                    },
                );
                state.set_meta(&key, MetaMap::from([(SmolStr::new(META_KEY), json!(true))]));
                debug!(key = %key, "optimistic apply");
                applied.push(Applied {
                    key,
                    snapshot,
                    target: target.clone(),
                });
            }
        }
        applied
    }

    fn rollback(ctx: &Ctx, applied: &[Applied], error: Option<&Value>) {
        let state = ctx.state();
        for apply in applied {
            if apply.target.rollback_on_error {
                let restore = match &apply.snapshot {
                    Some(snapshot) => PatchOp::Set(snapshot.clone()),
                    None => PatchOp::Clear,
                };
                state.set_cache(
                    &apply.key,
                    CachePatch {
                        state: Some(StatePatch {
                            data: restore,
                            ..Default::default()
                        }),
                        previous_data: PatchOp::Clear,
                        ..Default::default()
                    },
                );
                debug!(key = %apply.key, "optimistic rollback");
            } else {
                state.set_cache(
                    &apply.key,
                    CachePatch {
                        previous_data: PatchOp::Clear,
                        ..Default::default()
                    },
                );
            }
            state.set_meta(
                &apply.key,
                MetaMap::from([(SmolStr::new(META_KEY), json!(false))]),
            );
        }
        for apply in applied {
            if let Some(hook) = &apply.target.on_error {
                hook(error);
            }
        }
    }

    fn confirm(ctx: &Ctx, applied: &[Applied], response: &Response) {
        let state = ctx.state();
        for apply in applied {
            state.set_cache(
                &apply.key,
                CachePatch {
                    previous_data: PatchOp::Clear,
                    ..Default::default()
                },
            );
            state.set_meta(
                &apply.key,
                MetaMap::from([(SmolStr::new(META_KEY), json!(false))]),
            );
            if apply.target.apply_on_success
                && let Some(updater) = &apply.target.updater
            {
                let current = state.get_cache(&apply.key).and_then(|entry| entry.state.data);
                let reconciled = updater(current.as_ref(), response.data.as_ref());
                state.set_cache(&apply.key, CachePatch::state(StatePatch::data(reconciled)));
            }
        }
    }
}

#[async_trait]
impl Plugin for OptimisticPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn operations(&self) -> &[OperationType] {
        &[OperationType::Write]
    }

    async fn middleware(&self, ctx: &Ctx, next: Next<'_>) -> Result<Response, Error> {
        let targets = ctx.plugin_options().optimistic.clone();
        if targets.is_empty() {
            return next.run(ctx).await;
        }

        let applied = Self::apply_targets(ctx, &targets);
        if !applied.is_empty()
            && let Some(exports) = ctx.plugin_exports(invalidation::NAME)
            && let Ok(handle) = exports.downcast::<InvalidationHandle>()
        {
            // The write must not mark stale the caches just updated.
            handle.set_mode_for_call(ctx, InvalidationMode::None);
        }

        match next.run(ctx).await {
            Ok(response) if response.is_failure() => {
                Self::rollback(ctx, &applied, response.error.as_ref());
                Ok(response)
            }
            Ok(response) => {
                Self::confirm(ctx, &applied, &response);
                Ok(response)
            }
            Err(error) => {
                Self::rollback(ctx, &applied, None);
                Err(error)
            }
        }
    }
}
