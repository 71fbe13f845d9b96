//! Write invalidation.
//!
//! After a successful write (or queue item) this plugin marks tags stale
//! and publishes them on the `invalidate` topic. Which tags depends on
//! the [`InvalidationMode`]: every tag the write carries (`All`, the
//! default), an explicit subset (`Tags`), or nothing (`None`). Marking is
//! lazy - nothing refetches until a listener (the refetch plugin, a
//! mounted controller) turns the invalidation into a `refetch` emission.
//!
//! The per-call mode can be overridden: the optimistic plugin turns it off
//! for writes whose target caches it already updated provisionally, via
//! the [`InvalidationHandle`] this plugin exports.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use smol_str::SmolStr;
use tracing::debug;

use fetchbox_core::Response;

use crate::context::Ctx;
use crate::error::Error;
use crate::events::Event;
use crate::plugin::{OperationType, Plugin};

/// Registered name of the invalidation plugin.
pub const NAME: &str = "fetchbox:invalidation";

/// Context scratch key carrying a per-call mode override.
pub const MODE_TEMP_KEY: &str = "fetchbox:invalidation:mode";

/// What a successful write invalidates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InvalidationMode {
    /// Mark every tag the write carries stale and publish them.
    #[default]
    All,
    /// Mark only the listed tags stale, whatever the write carries.
    Tags(Vec<SmolStr>),
    /// Skip invalidation entirely.
    None,
}

impl InvalidationMode {
    /// Encodes the mode for the per-call scratch map.
    pub fn as_value(&self) -> Value {
        match self {
            InvalidationMode::All => json!("all"),
            InvalidationMode::Tags(tags) => json!({"tags": tags}),
            InvalidationMode::None => json!("none"),
        }
    }

    fn parse(raw: &Value) -> Option<Self> {
        match raw {
            Value::String(mode) if mode == "all" => Some(InvalidationMode::All),
            Value::String(mode) if mode == "none" => Some(InvalidationMode::None),
            Value::Object(map) => map.get("tags").and_then(Value::as_array).map(|tags| {
                InvalidationMode::Tags(
                    tags.iter()
                        .filter_map(Value::as_str)
                        .map(SmolStr::new)
                        .collect(),
                )
            }),
            _ => Option::None,
        }
    }
}

#[derive(Debug, Default)]
struct InvalidationState {
    default_mode: Mutex<InvalidationMode>,
}

/// Marks tags stale and publishes `invalidate` after successful writes.
#[derive(Debug, Default)]
pub struct InvalidationPlugin {
    shared: Arc<InvalidationState>,
}

impl InvalidationPlugin {
    /// Creates the plugin with the `All` default mode.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Capability object exported for cross-plugin discovery.
pub struct InvalidationHandle {
    shared: Arc<InvalidationState>,
}

impl InvalidationHandle {
    /// Changes the mode applied when neither the call options nor the
    /// call scratch carry an override.
    pub fn set_default_mode(&self, mode: InvalidationMode) {
        *self
            .shared
            .default_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = mode;
    }

    /// Overrides the mode for one in-flight call.
    pub fn set_mode_for_call(&self, ctx: &Ctx, mode: InvalidationMode) {
        ctx.set_temp(MODE_TEMP_KEY, mode.as_value());
    }

    /// The mode applied when no per-call override is present.
    pub fn default_mode(&self) -> InvalidationMode {
        self.shared
            .default_mode
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Plugin for InvalidationPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn operations(&self) -> &[OperationType] {
        &[OperationType::Write, OperationType::Queue]
    }

    async fn after_response(
        &self,
        ctx: &Ctx,
        response: &Response,
    ) -> Result<Option<Response>, Error> {
        if !response.is_success() {
            return Ok(None);
        }
        let mode = ctx
            .get_temp(MODE_TEMP_KEY)
            .and_then(|raw| InvalidationMode::parse(&raw))
            .or_else(|| ctx.plugin_options().invalidation_mode.clone())
            .unwrap_or_else(|| {
                self.shared
                    .default_mode
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            });

        let tags = match mode {
            InvalidationMode::None => return Ok(None),
            InvalidationMode::All => ctx.tags().to_vec(),
            InvalidationMode::Tags(selected) => selected,
        };
        if tags.is_empty() {
            return Ok(None);
        }
        debug!(?tags, "write invalidation");
        ctx.state().mark_stale(&tags);
        ctx.events().emit(Event::Invalidate(tags));
        Ok(None)
    }

    fn exports(&self, _ctx: &Ctx) -> Option<Box<dyn Any + Send + Sync>> {
        Some(Box::new(InvalidationHandle {
            shared: Arc::clone(&self.shared),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_value_roundtrip() {
        let modes = [
            InvalidationMode::All,
            InvalidationMode::None,
            InvalidationMode::Tags(vec![SmolStr::new("posts"), SmolStr::new("feed")]),
        ];
        for mode in modes {
            assert_eq!(InvalidationMode::parse(&mode.as_value()), Some(mode));
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert_eq!(InvalidationMode::parse(&json!("sometimes")), None);
        assert_eq!(InvalidationMode::parse(&json!(3)), None);
        assert_eq!(InvalidationMode::parse(&json!({"mode": "all"})), None);
    }
}
