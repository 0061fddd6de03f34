use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Externally raised cancellation flag observed at block boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    canceled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Clears the flag before the next file is staged.
    pub fn reset(&self) {
        self.canceled.store(false, Ordering::Release);
    }
}
