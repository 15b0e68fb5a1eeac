//! Error types for channel and pipeline operations.

use thiserror::Error;

/// Errors raised by channel and pipeline operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Operation on a closed channel; pending writes fail with this cause.
    #[error("channel is closed")]
    Closed,

    /// A pipeline already holds a handler under this name.
    #[error("duplicate handler name {name:?}")]
    DuplicateHandler {
        /// The contested name.
        name: String,
    },

    /// No handler registered under this name.
    #[error("no handler named {name:?}")]
    UnknownHandler {
        /// The requested name.
        name: String,
    },

    /// The channel already has an owning executor.
    #[error("channel already registered")]
    AlreadyRegistered,

    /// The operation requires a registered channel.
    #[error("channel not registered to an executor")]
    NotRegistered,

    /// Registration refused because the target executor is shutting down.
    #[error("executor rejected channel registration")]
    RegistrationRejected,
}
