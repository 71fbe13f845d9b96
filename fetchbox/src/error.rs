//! Error types for data-layer operations.
//!
//! Transport failures and aborts are *responses*, never `Err`s (see
//! `fetchbox_core::transport`). The error type here covers the remaining
//! kinds: plugin graph construction failures, middleware errors (which halt
//! chain unwinding), and lifecycle hook errors.

use thiserror::Error;

/// Plugin graph construction failure, raised when building the executor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// A plugin declared a dependency that is not registered.
    #[error("Plugin {dependent} depends on {dependency} which is not registered")]
    MissingDependency {
        /// The plugin declaring the dependency.
        dependent: String,
        /// The missing dependency.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Circular dependency detected")]
    CircularDependency,

    /// Two registered plugins share a name.
    #[error("Plugin {0} is registered more than once")]
    DuplicateName(String),
}

/// Error type for controller and executor operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Plugin graph construction failure.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// Error raised inside a plugin middleware.
    ///
    /// Unwinding halts where the error was raised; `after_response` hooks
    /// do not run.
    #[error("middleware error: {0}")]
    Middleware(Box<dyn std::error::Error + Send + Sync>),

    /// Error raised inside a plugin lifecycle hook.
    #[error("lifecycle error: {0}")]
    Lifecycle(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps a plugin-raised middleware error.
    pub fn middleware(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Middleware(err.into())
    }

    /// Wraps a plugin-raised lifecycle error.
    pub fn lifecycle(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Lifecycle(err.into())
    }
}
