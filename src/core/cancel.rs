//! # Cooperative Cancellation
//!
//! A sweep is blocking work. The binary installs a Ctrl-C handler that flips a
//! shared flag; every long-running step (subprocess polling, sample loop, model
//! loading) checks it and unwinds with [`EvalError::Cancelled`] so temporary
//! directories are dropped and the partially written sweep result stays valid.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{EvalError, EvalResult};

/// Shared cancellation flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return `Err(Cancelled)` once cancellation has been requested.
    pub fn check(&self, during: &str) -> EvalResult<()> {
        if self.is_cancelled() {
            Err(EvalError::cancelled(during))
        } else {
            Ok(())
        }
    }
}
