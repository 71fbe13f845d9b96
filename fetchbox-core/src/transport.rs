//! The injectable transport boundary.
//!
//! The data layer treats the actual HTTP send as a leaf function: it hands a
//! [`TransportRequest`] to a user-supplied [`Transport`] and receives a
//! [`Response`] back. Everything above that line (caching, deduplication,
//! middleware, invalidation) is transport-agnostic.
//!
//! A transport reports failure *in* the response (`error` field), not by
//! panicking or returning `Err`; cancellation is reported with
//! `aborted: true`. Transports should observe `request.signal`, but even a
//! transport that ignores it is raced against the signal by the calling
//! controller.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::abort::AbortSignal;
use crate::request::{HeaderMap, Method};
use crate::response::Response;

/// One fully resolved request, ready to send.
#[derive(Clone, Debug, Default)]
pub struct TransportRequest {
    /// Request path with `:param` placeholders.
    pub path: String,
    /// HTTP method.
    pub method: Method,
    /// Resolved flat headers.
    pub headers: HeaderMap,
    /// Query-string parameters.
    pub query: Option<serde_json::Value>,
    /// Path parameters.
    pub params: Option<serde_json::Value>,
    /// Request body.
    pub body: Option<serde_json::Value>,
    /// Transport-level cache mode hint.
    pub cache: Option<String>,
    /// Cancellation signal for this call.
    pub signal: AbortSignal,
}

/// Trait for sending requests to the wire.
///
/// # Example
///
/// ```
/// use fetchbox_core::{Response, Transport, TransportRequest};
///
/// struct StaticTransport;
///
/// #[async_trait::async_trait]
/// impl Transport for StaticTransport {
///     async fn send(&self, _request: TransportRequest) -> Response {
///         Response::ok(serde_json::json!({"id": 1}))
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends the request and resolves with its response.
    async fn send(&self, request: TransportRequest) -> Response;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn send(&self, request: TransportRequest) -> Response {
        self.as_ref().send(request).await
    }
}

type TransportFn = dyn Fn(TransportRequest) -> BoxFuture<'static, Response> + Send + Sync;

/// A [`Transport`] built from a closure.
pub struct FnTransport {
    f: Arc<TransportFn>,
}

impl FnTransport {
    /// Wraps an async closure as a transport.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(TransportRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Response> + Send + 'static,
    {
        FnTransport {
            f: Arc::new(move |request| Box::pin(f(request))),
        }
    }
}

impl Clone for FnTransport {
    fn clone(&self) -> Self {
        FnTransport {
            f: Arc::clone(&self.f),
        }
    }
}

impl std::fmt::Debug for FnTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnTransport(..)")
    }
}

#[async_trait]
impl Transport for FnTransport {
    async fn send(&self, request: TransportRequest) -> Response {
        (self.f)(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_transport() {
        let transport = FnTransport::new(|request: TransportRequest| async move {
            Response::ok(json!({"path": request.path}))
        });
        let response = transport
            .send(TransportRequest {
                path: "/posts".into(),
                ..Default::default()
            })
            .await;
        assert_eq!(response.data, Some(json!({"path": "/posts"})));
    }
}
