//! Cooperative cancellation shared by every long-running loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Clonable run flag. Loops poll [`Shutdown::is_running`] and exit once
/// [`Shutdown::cancel`] has been called on any clone.
#[derive(Clone, Debug)]
pub struct Shutdown {
    running: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("shutdown requested");
        }
    }

    /// The underlying flag, for APIs that poll a bare `AtomicBool`.
    pub fn flag(&self) -> &AtomicBool {
        &self.running
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_visible_to_clones() {
        let a = Shutdown::new();
        let b = a.clone();
        assert!(b.is_running());
        a.cancel();
        assert!(!b.is_running());
        assert!(!b.flag().load(Ordering::Relaxed));
        a.cancel();
    }
}
