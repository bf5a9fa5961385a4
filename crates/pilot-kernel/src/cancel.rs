//! [`CancelFlag`] – cooperative cancellation token.
//!
//! Long-running operations (goal bodies, plan steps, persistent waits,
//! in-flight inference calls) receive a clone of the flag and poll it at
//! safe points.  Raising the flag does not guarantee an immediate stop; it
//! guarantees the operation will observe the request at its next check.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cheaply cloneable cancellation flag.  All clones share one bit.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    raised: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Create an unraised flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.  Idempotent.
    pub fn raise(&self) {
        self.raised.store(true, Ordering::Release);
    }

    /// `true` once cancellation has been requested.
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    /// Lower the flag so the token can be reused for the next operation.
    pub fn reset(&self) {
        self.raised.store(false, Ordering::Release);
    }
}
