//! Active request counter with scoped release.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Number of responses currently in flight. Owned by the listener and
/// shared with every session it starts.
#[derive(Debug, Clone, Default)]
pub struct ActiveRequests {
    count: Arc<AtomicUsize>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more request. The count drops again when the guard is
    /// released or dropped, whichever comes first.
    pub fn acquire(&self) -> ActiveRequestGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        ActiveRequestGuard {
            count: Some(self.count.clone()),
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ActiveRequestGuard {
    count: Option<Arc<AtomicUsize>>,
}

impl ActiveRequestGuard {
    /// Decrement now. Later calls and the eventual drop do nothing.
    pub fn release(&mut self) {
        if let Some(count) = self.count.take() {
            count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn is_released(&self) -> bool {
        self.count.is_none()
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.release();
    }
}
