//! Cooperative cancellation token threaded into long-running operations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cloneable cancellation flag.
///
/// Cancellation is cooperative: workers check the token at their natural
/// boundaries (archive entries, file blocks, cache entries) and wind down by
/// returning [`Error::Canceled`](crate::Error::Canceled).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token in the not-canceled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; may be called from any thread.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error out if cancellation has been requested.
    ///
    /// # Errors
    /// Returns [`Error::Canceled`](crate::Error::Canceled) once canceled.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_canceled() {
            Err(crate::Error::Canceled)
        } else {
            Ok(())
        }
    }
}
