//! Cancellation tokens for long-running index work.
//!
//! Traversals and diff passes are expected to poll a checkpoint frequently
//! so an operator-level cancel propagates promptly. Checkpoints are a
//! single atomic load and never touch I/O.

use crate::error::{Result, StrataError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cloneable cancellation flag owned by one queued task.
///
/// Cancelling one token never affects other tasks; the coordinator hands
/// an independent token to every task it queues.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        CancelToken {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cheap polling point: returns `Err(Cancelled)` once [`cancel`] has
    /// been called.
    ///
    /// [`cancel`]: CancelToken::cancel
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(StrataError::Cancelled)
        } else {
            Ok(())
        }
    }
}
