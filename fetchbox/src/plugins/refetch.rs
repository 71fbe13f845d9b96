//! Focus / reconnect / invalidate refetching.
//!
//! Lifecycle-only plugin: no middleware. On mount it wires event-bus
//! listeners for the signals the call opted into and converts each hit
//! into a `refetch` emission carrying this controller's query key. The
//! mounted controller owns that emission and re-executes with the force
//! flag.
//!
//! The `focus` and `online` topics are fed by the embedding adapter; the
//! `invalidate` topic is fed by the invalidation plugin, which is why this
//! plugin declares a dependency on it when both ship together.

use async_trait::async_trait;
use dashmap::DashMap;
use smol_str::SmolStr;
use tracing::debug;

use crate::context::Ctx;
use crate::error::Error;
use crate::events::{Event, RefetchEvent, RefetchReason, Subscription, topic};
use crate::plugin::{OperationType, Plugin};

use super::invalidation;

/// Registered name of the refetch plugin.
pub const NAME: &str = "fetchbox:refetch";

/// Subscribes to focus/online/invalidate and emits `refetch`.
#[derive(Debug, Default)]
pub struct RefetchPlugin {
    dependencies: Vec<SmolStr>,
    listeners: DashMap<SmolStr, Vec<Subscription>>,
}

impl RefetchPlugin {
    /// A standalone refetch plugin with no declared dependencies.
    pub fn new() -> Self {
        Self::default()
    }

    /// A refetch plugin ordered after the invalidation plugin. Use this
    /// when both are registered.
    pub fn with_invalidation() -> Self {
        RefetchPlugin {
            dependencies: vec![SmolStr::new(invalidation::NAME)],
            listeners: DashMap::new(),
        }
    }
}

#[async_trait]
impl Plugin for RefetchPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn operations(&self) -> &[OperationType] {
        &[OperationType::Read, OperationType::InfiniteRead]
    }

    fn dependencies(&self) -> Vec<SmolStr> {
        self.dependencies.clone()
    }

    async fn on_mount(&self, ctx: &Ctx) -> Result<(), Error> {
        let events = ctx.events();
        let options = ctx.plugin_options();
        let mut subscriptions = Vec::new();

        if !ctx.tags().is_empty() {
            let tags = ctx.tags().to_vec();
            let query_key = ctx.query_key().clone();
            let bus = events.clone();
            subscriptions.push(events.subscribe(topic::INVALIDATE, move |event| {
                if let Event::Invalidate(invalidated) = event
                    && tags.iter().any(|tag| invalidated.contains(tag))
                {
                    bus.emit(Event::Refetch(RefetchEvent {
                        query_key: query_key.clone(),
                        reason: RefetchReason::Invalidate,
                    }));
                }
            }));
        }

        if options.refetch_on_focus {
            let query_key = ctx.query_key().clone();
            let bus = events.clone();
            subscriptions.push(events.subscribe(topic::FOCUS, move |_| {
                bus.emit(Event::Refetch(RefetchEvent {
                    query_key: query_key.clone(),
                    reason: RefetchReason::Focus,
                }));
            }));
        }

        if options.refetch_on_reconnect {
            let query_key = ctx.query_key().clone();
            let bus = events.clone();
            subscriptions.push(events.subscribe(topic::ONLINE, move |_| {
                bus.emit(Event::Refetch(RefetchEvent {
                    query_key: query_key.clone(),
                    reason: RefetchReason::Reconnect,
                }));
            }));
        }

        if !subscriptions.is_empty() {
            debug!(key = %ctx.query_key(), listeners = subscriptions.len(), "refetch listeners attached");
            self.listeners
                .entry(SmolStr::new(ctx.query_key().as_str()))
                .or_default()
                .extend(subscriptions);
        }
        Ok(())
    }

    async fn on_unmount(&self, ctx: &Ctx) -> Result<(), Error> {
        if let Some((_, subscriptions)) = self
            .listeners
            .remove(&SmolStr::new(ctx.query_key().as_str()))
        {
            for subscription in subscriptions {
                subscription.unsubscribe();
            }
        }
        Ok(())
    }
}
