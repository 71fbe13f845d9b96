//! TTL cache middleware.
//!
//! The short-circuit path serves a committed entry when it is fresh: data
//! defined, not flagged stale, and younger than the staleness window
//! (per-call `stale_time`, else the plugin default, default zero). A stale
//! entry is treated as a miss - its data stays visible to readers while
//! the chain below refetches.
//!
//! On the way back out the plugin writes through: successful responses
//! commit (and un-flag staleness), errors are recorded without disturbing
//! the last good data.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use fetchbox_core::{CachePatch, Response, StatePatch};

use crate::context::Ctx;
use crate::controller::now_millis;
use crate::error::Error;
use crate::executor::Next;
use crate::plugin::{OperationType, Plugin};

/// Registered name of the cache plugin.
pub const NAME: &str = "fetchbox:cache";

/// TTL/stale short-circuit plus write-through on response.
#[derive(Debug, Default)]
pub struct CachePlugin {
    default_stale_time: Duration,
}

impl CachePlugin {
    /// A cache plugin whose default staleness window is zero: only
    /// per-call `stale_time` options enable reuse.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache plugin with a global default staleness window.
    pub fn with_default_stale_time(default_stale_time: Duration) -> Self {
        CachePlugin { default_stale_time }
    }
}

#[async_trait]
impl Plugin for CachePlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn operations(&self) -> &[OperationType] {
        &[OperationType::Read, OperationType::InfiniteRead]
    }

    async fn middleware(&self, ctx: &Ctx, next: Next<'_>) -> Result<Response, Error> {
        let state = ctx.state();
        let key = ctx.query_key();

        if !ctx.force_refetch()
            && let Some(entry) = state.get_cache(key)
            && let Some(data) = entry.state.data
            && !entry.stale
        {
            let stale_time = ctx
                .plugin_options()
                .stale_time
                .unwrap_or(self.default_stale_time);
            let age = now_millis().saturating_sub(entry.state.timestamp);
            if age <= stale_time.as_millis() as i64 {
                debug!(key = %key, age, "cache hit");
                #[cfg(feature = "metrics")]
                metrics::counter!(*crate::metrics::CACHE_HIT_COUNTER).increment(1);
                return Ok(Response::ok(data));
            }
        }
        #[cfg(feature = "metrics")]
        metrics::counter!(*crate::metrics::CACHE_MISS_COUNTER).increment(1);

        let response = next.run(ctx).await?;

        if response.is_success() {
            if let Some(data) = response.data.clone() {
                state.set_cache(
                    key,
                    CachePatch::commit(data, now_millis()).tags(ctx.tags().to_vec()),
                );
            }
        } else if let Some(error) = &response.error {
            // Record the failure; the last good data stays untouched.
            state.set_cache(key, CachePatch::state(StatePatch::error(error.clone())));
        }
        Ok(response)
    }
}
