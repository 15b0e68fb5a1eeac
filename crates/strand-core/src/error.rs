//! Error types for promises, executors and the constant pool.

use std::sync::Arc;
use thiserror::Error;

/// Shared failure cause carried by promises.
pub type Cause = Arc<dyn std::error::Error + Send + Sync>;

/// Reported as the cause of a promise completed by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation was cancelled")]
pub struct CancelledError;

/// Errors raised by promise operations.
#[derive(Debug, Clone, Error)]
pub enum PromiseError {
    /// A `set_*` call hit an already-completed promise.
    #[error("promise already complete")]
    AlreadyComplete,

    /// A blocking wait was attempted on the promise's own event loop.
    #[error("blocking await called from the owning event loop")]
    BlockingInLoop,

    /// `sync` observed a failed promise; the original cause is attached.
    #[error("promise failed: {0}")]
    Failed(Cause),

    /// `sync` observed a cancelled promise.
    #[error("promise was cancelled")]
    Cancelled,
}

/// Errors raised by executor submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// The executor no longer accepts work.
    #[error("executor terminated")]
    Terminated,
}

/// Errors raised by the constant pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstantError {
    /// `new_instance` found the name already taken.
    #[error("constant {name:?} already exists")]
    Duplicate {
        /// The contested name.
        name: String,
    },
}
