//! Shared test doubles for integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use fetchbox::{Response, Transport, TransportRequest};

type HandlerFn = dyn Fn(&TransportRequest) -> Response + Send + Sync;

/// Counting transport with a scripted handler and optional latency.
pub struct MockTransport {
    calls: AtomicUsize,
    delay: Option<Duration>,
    handler: Box<HandlerFn>,
}

impl MockTransport {
    /// Always answers with the given data.
    pub fn ok(data: Value) -> Arc<Self> {
        Self::with_handler(move |_| Response::ok(data.clone()))
    }

    /// Always answers with the given error.
    #[allow(dead_code)]
    pub fn failing(status: u16, error: Value) -> Arc<Self> {
        Self::with_handler(move |_| Response::error(status, error.clone()))
    }

    /// Answers by running the handler against each request.
    pub fn with_handler(
        handler: impl Fn(&TransportRequest) -> Response + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(MockTransport {
            calls: AtomicUsize::new(0),
            delay: None,
            handler: Box::new(handler),
        })
    }

    /// Adds latency before each answer.
    pub fn delayed(
        delay: Duration,
        handler: impl Fn(&TransportRequest) -> Response + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(MockTransport {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
            handler: Box::new(handler),
        })
    }

    /// Number of transport dispatches so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Response {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(&request)
    }
}

/// Polls until `probe` returns true or the timeout elapses.
#[allow(dead_code)]
pub async fn wait_until(timeout: Duration, probe: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
