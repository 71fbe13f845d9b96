//! A FIFO counting semaphore with dynamic capacity.
//!
//! Backs the queue controller. tokio's own semaphore cannot shrink its
//! capacity or wake every waiter on reset, hence this primitive:
//!
//! - `acquire` resolves `true` once a slot is held, `false` when the
//!   semaphore was reset while waiting
//! - `release` hands the freed slot to the head of the wait queue
//! - `set_concurrency` re-sizes; growing wakes up to the delta of waiters
//! - `reset` wakes every waiter with the not-acquired signal
//!
//! Waiters are woken strictly in arrival order.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

struct SemState {
    current: usize,
    max: usize,
    waiters: VecDeque<oneshot::Sender<bool>>,
}

/// Bounded counting semaphore with FIFO waiters and dynamic capacity.
pub struct Semaphore {
    state: Mutex<SemState>,
}

impl Semaphore {
    /// Creates a semaphore with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Semaphore {
            state: Mutex::new(SemState {
                current: 0,
                max: capacity,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquires a slot, waiting FIFO behind earlier callers when the
    /// semaphore is full.
    ///
    /// Resolves `true` once the slot is held. Resolves `false` when
    /// [`reset`](Semaphore::reset) released this waiter without a slot.
    pub async fn acquire(&self) -> bool {
        let receiver = {
            let mut state = self.lock();
            if state.current < state.max {
                state.current += 1;
                return true;
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };
        // A successful send means the releaser already counted this slot.
        receiver.await.unwrap_or(false)
    }

    /// Releases a held slot, waking the head of the wait queue if any.
    pub fn release(&self) {
        let mut state = self.lock();
        state.current = state.current.saturating_sub(1);
        Self::wake_waiters(&mut state);
    }

    /// Re-configures capacity. Growing wakes up to the delta of waiters;
    /// shrinking lets holders drain naturally.
    pub fn set_concurrency(&self, capacity: usize) {
        let mut state = self.lock();
        state.max = capacity;
        Self::wake_waiters(&mut state);
    }

    /// Wakes every waiter with the not-acquired signal. Held slots are
    /// unaffected.
    pub fn reset(&self) {
        let mut state = self.lock();
        for sender in state.waiters.drain(..) {
            let _ = sender.send(false);
        }
    }

    /// Number of slots currently held by running acquirers.
    pub fn running(&self) -> usize {
        self.lock().current
    }

    /// Current capacity.
    pub fn capacity(&self) -> usize {
        self.lock().max
    }

    /// Number of parked waiters.
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    fn wake_waiters(state: &mut SemState) {
        while state.current < state.max {
            match state.waiters.pop_front() {
                // A failed send means the waiter gave up (dropped its
                // receiver); the slot goes to the next in line.
                Some(sender) => {
                    if sender.send(true).is_ok() {
                        state.current += 1;
                    }
                }
                None => break,
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, SemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Semaphore")
            .field("current", &state.current)
            .field("max", &state.max)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
