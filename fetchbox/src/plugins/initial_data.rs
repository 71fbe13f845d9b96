//! One-shot initial data seeding.
//!
//! The first call of a hook instance with `initial_data` configured and an
//! empty cache pre-seeds the entry, stamps `meta.isInitialData`, and either
//! short-circuits with the seed or (with `refetch_on_initial_data`)
//! continues down the chain to replace it in the background. Subsequent
//! calls of the same instance pass through; a successful real response
//! clears the flag.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use smol_str::SmolStr;
use tracing::debug;

use fetchbox_core::{CachePatch, MetaMap, Response};

use crate::context::Ctx;
use crate::controller::now_millis;
use crate::error::Error;
use crate::executor::Next;
use crate::plugin::{OperationType, Plugin};

/// Registered name of the initial-data plugin.
pub const NAME: &str = "fetchbox:initial-data";

/// Meta key stamped on seeded entries.
pub const META_KEY: &str = "isInitialData";

/// One-shot seed per hook instance, with optional background refetch.
#[derive(Debug, Default)]
pub struct InitialDataPlugin {
    seen: DashMap<u64, ()>,
}

impl InitialDataPlugin {
    /// Creates the plugin.
    pub fn new() -> Self {
        Self::default()
    }

    fn clear_flag(ctx: &Ctx) {
        let flagged = ctx
            .state()
            .get_cache(ctx.query_key())
            .map(|entry| entry.meta.get(META_KEY) == Some(&json!(true)))
            .unwrap_or(false);
        if flagged {
            ctx.state().set_meta(
                ctx.query_key(),
                MetaMap::from([(SmolStr::new(META_KEY), json!(false))]),
            );
        }
    }
}

#[async_trait]
impl Plugin for InitialDataPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn operations(&self) -> &[OperationType] {
        &[OperationType::Read, OperationType::InfiniteRead]
    }

    async fn middleware(&self, ctx: &Ctx, next: Next<'_>) -> Result<Response, Error> {
        let first_call = self.seen.insert(ctx.instance_id(), ()).is_none();
        let options = ctx.plugin_options();

        if first_call
            && let Some(initial) = options.initial_data.clone()
        {
            let missing = ctx
                .state()
                .get_cache(ctx.query_key())
                .map(|entry| entry.state.data.is_none())
                .unwrap_or(true);
            if missing {
                debug!(key = %ctx.query_key(), "seeding initial data");
                ctx.state().set_cache(
                    ctx.query_key(),
                    CachePatch::commit(initial.clone(), now_millis()).tags(ctx.tags().to_vec()),
                );
                ctx.state().set_meta(
                    ctx.query_key(),
                    MetaMap::from([(SmolStr::new(META_KEY), json!(true))]),
                );

                if options.refetch_on_initial_data {
                    let response = next.run(ctx).await?;
                    if response.is_success() {
                        Self::clear_flag(ctx);
                    }
                    return Ok(response);
                }
                return Ok(Response::ok(initial));
            }
        }

        let response = next.run(ctx).await?;
        if response.is_success() {
            Self::clear_flag(ctx);
        }
        Ok(response)
    }

    async fn on_unmount(&self, ctx: &Ctx) -> Result<(), Error> {
        self.seen.remove(&ctx.instance_id());
        Ok(())
    }
}
