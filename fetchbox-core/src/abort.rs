//! Abort signalling.
//!
//! An [`AbortController`] owns the ability to cancel; its
//! [`AbortSignal`]s are handed to transports and awaited by controllers.
//! Aborting is idempotent and signals are cheap to clone.
//!
//! Cancellation is cooperative: firing the signal resolves every pending
//! [`AbortSignal::cancelled`] future, and the caller racing the transport
//! against that future converts the in-flight call into an aborted
//! response. Nothing is forcibly torn down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    aborted: AtomicBool,
    notify: Notify,
}

/// Owner side of an abort signal.
#[derive(Clone, Debug, Default)]
pub struct AbortController {
    shared: Arc<Shared>,
}

impl AbortController {
    /// Creates a fresh, un-aborted controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a signal tied to this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Fires the signal. Idempotent.
    pub fn abort(&self) {
        if !self.shared.aborted.swap(true, Ordering::SeqCst) {
            self.shared.notify.notify_waiters();
        }
    }

    /// Whether the signal has fired.
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }
}

/// Receiver side of an abort signal.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    shared: Arc<Shared>,
}

impl AbortSignal {
    /// A signal that never fires, for callers without a controller.
    pub fn never() -> Self {
        AbortSignal {
            shared: Arc::new(Shared::default()),
        }
    }

    /// Whether the signal has fired.
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// Resolves once the signal fires. Resolves immediately if it already
    /// has.
    pub async fn cancelled(&self) {
        while !self.is_aborted() {
            let notified = self.shared.notify.notified();
            // Re-check after registering the waiter: an abort racing the
            // registration would otherwise be missed.
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::never()
    }
}
