use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ChunkyError, Result};

/// Cooperative cancellation flag shared between a pipeline driver and its
/// workers. Checked at step boundaries: walk iterations, rate-limiter waits,
/// and before each file in a download batch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Canceled)` if the token has fired.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(ChunkyError::Canceled)
        } else {
            Ok(())
        }
    }
}
