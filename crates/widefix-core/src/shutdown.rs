use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Cancellation flag for the init worker.
///
/// [`wait`](Self::wait) sleeps between module lookups and wakes as soon as
/// the host detaches, so unloading never blocks on a full retry delay.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter. Idempotent.
    pub fn trigger(&self) {
        *self.triggered.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `delay`. Returns `true` once the signal is triggered,
    /// `false` if the full delay elapsed.
    pub fn wait(&self, delay: Duration) -> bool {
        let triggered = self.triggered.lock().unwrap_or_else(PoisonError::into_inner);
        let (triggered, _) = self
            .wake
            .wait_timeout_while(triggered, delay, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *triggered
    }
}
