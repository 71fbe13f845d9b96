//! The composition root.
//!
//! A [`DataLayer`] owns the shared services - state manager, event bus,
//! frozen plugin executor, and the injected transport - and mints
//! controllers over them. The (out-of-scope) schema-typed proxy and the
//! framework adapters sit on top of this type.

use std::sync::Arc;

use fetchbox_core::Transport;

use crate::controller::{
    InfiniteController, InfiniteSpec, OperationController, OperationSpec, QueueController,
    QueueSpec, Services,
};
use crate::error::PluginError;
use crate::events::EventBus;
use crate::executor::PluginExecutor;
use crate::plugin::{OperationType, Plugin};
use crate::state_manager::StateManager;

/// Shared-service owner and controller factory.
///
/// # Example
///
/// ```
/// use fetchbox::prelude::*;
/// use fetchbox_core::FnTransport;
/// use serde_json::json;
///
/// # fn main() -> Result<(), fetchbox::PluginError> {
/// let layer = DataLayer::builder()
///     .transport(FnTransport::new(|_request| async {
///         fetchbox_core::Response::ok(json!([]))
///     }))
///     .with_default_plugins()
///     .build()?;
///
/// let posts = layer.read(OperationSpec::get("/posts").tag("posts"));
/// # let _ = posts;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct DataLayer {
    services: Services,
}

impl DataLayer {
    /// Creates a new [`DataLayerBuilder`].
    pub fn builder() -> DataLayerBuilder {
        DataLayerBuilder::new()
    }

    /// Mints a read controller.
    pub fn read(&self, spec: OperationSpec) -> OperationController {
        OperationController::new(OperationType::Read, spec, self.services.clone())
    }

    /// Mints a write controller.
    pub fn write(&self, spec: OperationSpec) -> OperationController {
        OperationController::new(OperationType::Write, spec, self.services.clone())
    }

    /// Mints an infinite read controller.
    pub fn infinite(&self, spec: InfiniteSpec) -> InfiniteController {
        InfiniteController::new(spec, self.services.clone())
    }

    /// Mints a queue controller.
    pub fn queue(&self, spec: QueueSpec) -> QueueController {
        QueueController::new(spec, self.services.clone())
    }

    /// The process-wide state manager.
    pub fn state(&self) -> &Arc<StateManager> {
        &self.services.state
    }

    /// The event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.services.events
    }

    /// The frozen plugin executor.
    pub fn executor(&self) -> &Arc<PluginExecutor> {
        &self.services.executor
    }
}

/// Builder for [`DataLayer`].
#[derive(Default)]
pub struct DataLayerBuilder {
    transport: Option<Arc<dyn Transport>>,
    plugins: Vec<Arc<dyn Plugin>>,
    state: Option<Arc<StateManager>>,
    events: Option<Arc<EventBus>>,
}

impl DataLayerBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the injected transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Sets an already shared transport.
    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registers one plugin. Registration order is middleware order,
    /// subject to declared dependencies.
    pub fn plugin(mut self, plugin: impl Plugin) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Registers a list of plugins.
    pub fn plugins(mut self, plugins: impl IntoIterator<Item = Arc<dyn Plugin>>) -> Self {
        self.plugins.extend(plugins);
        self
    }

    /// Registers the built-in plugin set
    /// ([`plugins::defaults`](crate::plugins::defaults)).
    pub fn with_default_plugins(mut self) -> Self {
        self.plugins.extend(crate::plugins::defaults());
        self
    }

    /// Shares an existing state manager (several layers can cooperate on
    /// one cache).
    pub fn state(mut self, state: Arc<StateManager>) -> Self {
        self.state = Some(state);
        self
    }

    /// Shares an existing event bus.
    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Resolves plugin ordering and builds the layer.
    ///
    /// Fails with [`PluginError`] on unknown dependencies or cycles.
    /// Without a transport, requests resolve to a 0-status error response.
    pub fn build(self) -> Result<DataLayer, PluginError> {
        let executor = Arc::new(PluginExecutor::new(self.plugins)?);
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(NoTransport) as Arc<dyn Transport>);
        Ok(DataLayer {
            services: Services {
                state: self.state.unwrap_or_default(),
                events: self.events.unwrap_or_default(),
                executor,
                transport,
            },
        })
    }
}

/// Fallback transport answering every request with a 0-status error.
///
/// Lets cache-only setups (tests, storybook-style fixtures) build a layer
/// without wiring a real transport.
struct NoTransport;

#[async_trait::async_trait]
impl Transport for NoTransport {
    async fn send(
        &self,
        _request: fetchbox_core::TransportRequest,
    ) -> fetchbox_core::Response {
        fetchbox_core::Response::error(0, serde_json::json!("no transport configured"))
    }
}
