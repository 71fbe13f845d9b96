//! Built-in plugins.
//!
//! Each plugin packages one concern: TTL caching, initial-data seeding,
//! focus/reconnect/invalidate refetching, write invalidation, debouncing,
//! throttling, and optimistic updates. They compose with third-party
//! plugins through the same [`Plugin`](crate::plugin::Plugin) contract.

use std::sync::Arc;

use fetchbox_core::Response;

use crate::context::Ctx;
use crate::plugin::Plugin;

pub mod cache;
pub mod debounce;
pub mod initial_data;
pub mod invalidation;
pub mod optimistic;
pub mod refetch;
pub mod throttle;

pub use cache::CachePlugin;
pub use debounce::{Debounce, DebouncePlugin};
pub use initial_data::InitialDataPlugin;
pub use invalidation::{InvalidationHandle, InvalidationMode, InvalidationPlugin};
pub use optimistic::{OptimisticPlugin, OptimisticTarget};
pub use refetch::RefetchPlugin;
pub use throttle::ThrottlePlugin;

/// The default plugin set, in registration order.
///
/// Cache sits outermost so hits short-circuit everything below it; the
/// throttle sits last so every other plugin still observes throttled
/// calls. The refetch plugin declares its dependency on the invalidation
/// plugin, which drives the `invalidate` topic it listens on.
pub fn defaults() -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(CachePlugin::new()),
        Arc::new(InitialDataPlugin::new()),
        Arc::new(InvalidationPlugin::new()),
        Arc::new(RefetchPlugin::with_invalidation()),
        Arc::new(DebouncePlugin::new()),
        Arc::new(OptimisticPlugin::new()),
        Arc::new(ThrottlePlugin::new()),
    ]
}

/// The rate-limiter answer when a call is suppressed: cached data when the
/// entry has any, the empty response otherwise.
pub(crate) fn cached_or_empty(ctx: &Ctx) -> Response {
    ctx.state()
        .get_cache(ctx.query_key())
        .and_then(|entry| entry.state.data)
        .map(Response::ok)
        .unwrap_or_else(Response::empty)
}
