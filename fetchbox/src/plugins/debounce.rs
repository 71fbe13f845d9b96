//! Debounce middleware.
//!
//! Rapid re-queries of the same logical endpoint are coalesced per stable
//! key - `path:method`, deliberately not the query key, so the same search
//! box with changing text shares one timer. Each new query cancels the
//! outstanding timer, records itself as the latest, and answers from cache
//! (or with the empty response). When the timer finally fires, one
//! `refetch` is emitted for whatever query was latest at that moment; the
//! owning controller re-executes it with the force flag, which bypasses
//! this plugin.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use tracing::debug;

use fetchbox_core::{DecodedKey, QueryKey, Response};

use crate::context::Ctx;
use crate::error::Error;
use crate::events::{Event, EventBus, RefetchEvent, RefetchReason};
use crate::executor::Next;
use crate::plugin::{OperationType, Plugin};

use super::cached_or_empty;

/// Registered name of the debounce plugin.
pub const NAME: &str = "fetchbox:debounce";

type DelayFn = dyn Fn(Option<&DecodedKey>) -> u64 + Send + Sync;

/// The debounce delay: fixed, or computed from the previously tracked
/// request of the same stable key.
#[derive(Clone)]
pub enum Debounce {
    /// Fixed delay in milliseconds.
    Millis(u64),
    /// Delay computed per call from the previous query.
    Dynamic(Arc<DelayFn>),
}

impl Debounce {
    /// A dynamically computed delay.
    pub fn dynamic(f: impl Fn(Option<&DecodedKey>) -> u64 + Send + Sync + 'static) -> Self {
        Debounce::Dynamic(Arc::new(f))
    }
}

impl From<u64> for Debounce {
    fn from(millis: u64) -> Self {
        Debounce::Millis(millis)
    }
}

impl From<Duration> for Debounce {
    fn from(duration: Duration) -> Self {
        Debounce::Millis(duration.as_millis() as u64)
    }
}

impl std::fmt::Debug for Debounce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debounce::Millis(millis) => f.debug_tuple("Debounce::Millis").field(millis).finish(),
            Debounce::Dynamic(_) => f.write_str("Debounce::Dynamic(..)"),
        }
    }
}

#[derive(Debug)]
struct Tracker {
    latest: QueryKey,
    timer: Option<JoinHandle<()>>,
}

/// Coalesces rapid re-queries per `path:method`.
#[derive(Debug, Default)]
pub struct DebouncePlugin {
    trackers: Arc<DashMap<SmolStr, Tracker>>,
}

impl DebouncePlugin {
    /// Creates the plugin.
    pub fn new() -> Self {
        Self::default()
    }

    fn stable_key(ctx: &Ctx) -> SmolStr {
        SmolStr::new(format!("{}:{}", ctx.path(), ctx.method()))
    }

    fn arm_timer(
        trackers: &Arc<DashMap<SmolStr, Tracker>>,
        stable: SmolStr,
        events: Arc<EventBus>,
        delay: Duration,
    ) -> JoinHandle<()> {
        let trackers = Arc::clone(trackers);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Emit for whatever query is latest at fire time. Any newer
            // query would have cancelled this timer first.
            let latest = trackers.get(&stable).map(|tracker| tracker.latest.clone());
            if let Some(latest) = latest {
                debug!(key = %latest, "debounce fired");
                events.emit(Event::Refetch(RefetchEvent {
                    query_key: latest,
                    reason: RefetchReason::Manual,
                }));
            }
        })
    }
}

#[async_trait]
impl Plugin for DebouncePlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn operations(&self) -> &[OperationType] {
        &[OperationType::Read]
    }

    async fn middleware(&self, ctx: &Ctx, next: Next<'_>) -> Result<Response, Error> {
        let Some(debounce) = ctx.plugin_options().debounce.clone() else {
            return next.run(ctx).await;
        };
        if ctx.force_refetch() {
            return next.run(ctx).await;
        }

        let stable = Self::stable_key(ctx);
        let key = ctx.query_key().clone();

        let (is_latest, previous) = match self.trackers.get(&stable) {
            Some(tracker) => (tracker.latest == key, tracker.latest.parse()),
            None => (false, None),
        };
        if is_latest {
            return Ok(cached_or_empty(ctx));
        }

        let millis = match &debounce {
            Debounce::Millis(millis) => *millis,
            Debounce::Dynamic(f) => f(previous.as_ref()),
        };

        {
            let mut tracker = self.trackers.entry(stable.clone()).or_insert_with(|| Tracker {
                latest: key.clone(),
                timer: None,
            });
            tracker.latest = key.clone();
            if let Some(timer) = tracker.timer.take() {
                timer.abort();
            }
            tracker.timer = Some(Self::arm_timer(
                &self.trackers,
                stable,
                Arc::clone(ctx.events()),
                Duration::from_millis(millis),
            ));
        }
        Ok(cached_or_empty(ctx))
    }

    async fn on_unmount(&self, ctx: &Ctx) -> Result<(), Error> {
        if let Some((_, tracker)) = self.trackers.remove(&Self::stable_key(ctx))
            && let Some(timer) = tracker.timer
        {
            timer.abort();
        }
        Ok(())
    }
}
