//! Scope guards that run cleanup on drop.

/// Guard that runs cleanup when dropped, including during unwinding.
pub struct CleanupGuard {
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl CleanupGuard {
    /// Creates a new cleanup guard.
    pub fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl std::fmt::Debug for CleanupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupGuard")
            .field("armed", &self.cleanup.is_some())
            .finish()
    }
}
