//! Plugin ordering, middleware composition, and lifecycle fan-out.
//!
//! The [`PluginExecutor`] holds the frozen, dependency-ordered plugin list.
//! Per call it filters plugins by operation type and composes their
//! middlewares into an onion: the first plugin is outermost, the `next` of
//! the innermost plugin is the core fetch. After the chain unwinds, each
//! plugin's `after_response` hook runs in plugin order; a hook returning a
//! response replaces it for the hooks after it. When a middleware errors,
//! unwinding halts and no `after_response` hook runs.
//!
//! Ordering is resolved once, at construction, by a stable topological
//! sort over declared `dependencies` (registration order breaks ties).
//! Unknown dependencies and cycles are construction errors.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use fetchbox_core::Response;

use crate::context::{ContextInput, Ctx, PluginContext};
use crate::error::{Error, PluginError};
use crate::plugin::{OperationType, Plugin};

/// The leaf of the middleware onion: dispatches the actual fetch.
pub type CoreFetch = dyn Fn(Ctx) -> BoxFuture<'static, Result<Response, Error>> + Send + Sync;

/// Lifecycle entry points fanned out to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Controller mounted.
    Mount,
    /// Controller unmounted.
    Unmount,
}

/// Continuation handed to a middleware.
///
/// `run` descends into the rest of the chain; a middleware that never calls
/// it short-circuits the call, and the transport is never invoked.
pub struct Next<'a> {
    plugins: &'a [Arc<dyn Plugin>],
    core: &'a CoreFetch,
}

impl Next<'_> {
    /// Runs the remainder of the chain.
    pub async fn run(self, ctx: &Ctx) -> Result<Response, Error> {
        match self.plugins.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    plugins: rest,
                    core: self.core,
                };
                head.middleware(ctx, next).await
            }
            None => (self.core)(Arc::clone(ctx)).await,
        }
    }
}

/// The frozen, dependency-ordered plugin list.
pub struct PluginExecutor {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginExecutor {
    /// Resolves plugin ordering and freezes the list.
    ///
    /// Fails when a declared dependency is not registered or when the
    /// dependency graph contains a cycle.
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Result<Self, PluginError> {
        let plugins = topo_sort(plugins)?;
        debug!(
            order = ?plugins.iter().map(|plugin| plugin.name()).collect::<Vec<_>>(),
            "plugin order resolved"
        );
        Ok(PluginExecutor { plugins })
    }

    /// The resolved plugin order.
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Whether the named plugin is registered.
    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.iter().any(|plugin| plugin.name() == name)
    }

    /// Builds a per-call context, injecting the plugin accessor.
    pub fn create_context(&self, input: ContextInput) -> Ctx {
        PluginContext::new(input, self.plugins.clone())
    }

    /// Runs the middleware chain for one call, then the `after_response`
    /// hooks.
    pub async fn execute_middleware(
        &self,
        operation: OperationType,
        ctx: &Ctx,
        core: &CoreFetch,
    ) -> Result<Response, Error> {
        let applicable: Vec<Arc<dyn Plugin>> = self
            .plugins
            .iter()
            .filter(|plugin| plugin.operations().contains(&operation))
            .cloned()
            .collect();

        let next = Next {
            plugins: &applicable,
            core,
        };
        let mut response = next.run(ctx).await?;

        for plugin in &applicable {
            if let Some(replacement) = plugin.after_response(ctx, &response).await? {
                response = replacement;
            }
        }
        Ok(response)
    }

    /// Fans a lifecycle phase out to every matching plugin, sequentially in
    /// plugin order. Errors propagate to the caller.
    pub async fn execute_lifecycle(
        &self,
        phase: LifecyclePhase,
        operation: OperationType,
        ctx: &Ctx,
    ) -> Result<(), Error> {
        for plugin in &self.plugins {
            if !plugin.operations().contains(&operation) {
                continue;
            }
            match phase {
                LifecyclePhase::Mount => plugin.on_mount(ctx).await?,
                LifecyclePhase::Unmount => plugin.on_unmount(ctx).await?,
            }
        }
        Ok(())
    }

    /// Fans the update lifecycle out to every matching plugin.
    pub async fn execute_update_lifecycle(
        &self,
        operation: OperationType,
        ctx: &Ctx,
        prev: &Ctx,
    ) -> Result<(), Error> {
        for plugin in &self.plugins {
            if plugin.operations().contains(&operation) {
                plugin.on_update(ctx, prev).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PluginExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginExecutor")
            .field(
                "plugins",
                &self.plugins.iter().map(|plugin| plugin.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Stable Kahn sort: every plugin lands after its dependencies,
/// registration order breaks ties.
fn topo_sort(plugins: Vec<Arc<dyn Plugin>>) -> Result<Vec<Arc<dyn Plugin>>, PluginError> {
    let count = plugins.len();
    for (index, plugin) in plugins.iter().enumerate() {
        if plugins[..index].iter().any(|other| other.name() == plugin.name()) {
            return Err(PluginError::DuplicateName(plugin.name().to_owned()));
        }
    }

    let index_of = |name: &str| plugins.iter().position(|plugin| plugin.name() == name);

    // dependency -> dependents edges and per-node indegree
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut indegree: Vec<usize> = vec![0; count];
    for (index, plugin) in plugins.iter().enumerate() {
        for dependency in plugin.dependencies() {
            let Some(dependency_index) = index_of(&dependency) else {
                return Err(PluginError::MissingDependency {
                    dependent: plugin.name().to_owned(),
                    dependency: dependency.to_string(),
                });
            };
            dependents[dependency_index].push(index);
            indegree[index] += 1;
        }
    }

    let mut sorted = Vec::with_capacity(count);
    let mut placed = vec![false; count];
    while sorted.len() < count {
        // Lowest registration index among ready nodes keeps the sort stable.
        let Some(ready) = (0..count).find(|&index| !placed[index] && indegree[index] == 0) else {
            return Err(PluginError::CircularDependency);
        };
        placed[ready] = true;
        for &dependent in &dependents[ready] {
            indegree[dependent] -= 1;
        }
        sorted.push(Arc::clone(&plugins[ready]));
    }
    Ok(sorted)
}
