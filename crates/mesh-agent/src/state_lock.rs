use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Single-slot, non-reentrant lock over the agent's one stateful local
/// resource. Acquisition never waits: a held lock refuses immediately.
#[derive(Clone, Debug, Default)]
pub struct StateLock {
    held: Arc<AtomicBool>,
}

impl StateLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if it is free. The slot is released when the returned
    /// guard drops, on every exit path.
    pub fn try_acquire(&self) -> Option<StateGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| StateGuard {
                held: Arc::clone(&self.held),
            })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Proof of holding the [`StateLock`].
#[derive(Debug)]
pub struct StateGuard {
    held: Arc<AtomicBool>,
}

impl StateGuard {
    pub fn release(self) {}
}

impl Drop for StateGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
