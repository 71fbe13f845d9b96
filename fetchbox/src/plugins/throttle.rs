//! At-most-once-per-window throttling.
//!
//! Tracks the last dispatch time per query key. A call landing inside the
//! window is answered from cache when possible, otherwise with the empty
//! response; a call outside the window records the new dispatch time and
//! descends. Register this plugin last so every other plugin still
//! observes throttled calls.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use fetchbox_core::{QueryKey, Response};

use crate::context::Ctx;
use crate::controller::now_millis;
use crate::error::Error;
use crate::executor::Next;
use crate::plugin::{OperationType, Plugin};

use super::cached_or_empty;

/// Registered name of the throttle plugin.
pub const NAME: &str = "fetchbox:throttle";

/// At-most-one dispatch per window per query key.
#[derive(Debug, Default)]
pub struct ThrottlePlugin {
    last_dispatch: DashMap<QueryKey, i64>,
}

impl ThrottlePlugin {
    /// Creates the plugin.
    pub fn new() -> Self {
        Self::default()
    }

    fn within_window(&self, key: &QueryKey, window: Duration, now: i64) -> bool {
        self.last_dispatch
            .get(key)
            .map(|last| now.saturating_sub(*last) < window.as_millis() as i64)
            .unwrap_or(false)
    }
}

#[async_trait]
impl Plugin for ThrottlePlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn operations(&self) -> &[OperationType] {
        &[OperationType::Read]
    }

    async fn middleware(&self, ctx: &Ctx, next: Next<'_>) -> Result<Response, Error> {
        let Some(window) = ctx.plugin_options().throttle else {
            return next.run(ctx).await;
        };
        let key = ctx.query_key().clone();
        let now = now_millis();

        if !ctx.force_refetch() && self.within_window(&key, window, now) {
            debug!(key = %key, "throttled");
            return Ok(cached_or_empty(ctx));
        }
        self.last_dispatch.insert(key, now);
        next.run(ctx).await
    }
}
