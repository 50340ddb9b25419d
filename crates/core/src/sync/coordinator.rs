//! Single-flight drain coordination
//!
//! At most one drain runs per process. A second caller gets `None` from
//! [`DrainCoordinator::try_acquire`] instead of waiting or queueing.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct DrainCoordinator {
    active: AtomicBool,
    current: Mutex<Option<CancellationToken>>,
}

/// Scoped ownership of the drain slot.
///
/// Dropping the permit releases the slot on every exit path, including
/// early returns, errors and cancellation of the owning future.
#[derive(Debug)]
pub struct DrainPermit<'a> {
    coordinator: &'a DrainCoordinator,
    token: CancellationToken,
}

impl DrainCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the drain slot, or `None` if a drain is already active.
    pub fn try_acquire(&self) -> Option<DrainPermit<'_>> {
        if self.active.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return None;
        }

        let token = CancellationToken::new();
        *self.current.lock() = Some(token.clone());
        Some(DrainPermit { coordinator: self, token })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Cancel the running drain, if any. Returns whether one was signalled.
    pub fn cancel_active(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl DrainPermit<'_> {
    /// Token cancelled by [`DrainCoordinator::cancel_active`].
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for DrainPermit<'_> {
    fn drop(&mut self) {
        self.coordinator.current.lock().take();
        self.coordinator.active.store(false, Ordering::Release);
    }
}
