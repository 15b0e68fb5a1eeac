//! Error types for buffer operations.

use thiserror::Error;

/// Errors raised by buffer operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufError {
    /// Retain/release on a buffer whose count is already 0, or count arithmetic
    /// that would overflow or underflow.
    #[error("illegal reference count operation (count: {count})")]
    IllegalRefCount {
        /// The count observed when the operation failed.
        count: usize,
    },

    /// An index fell outside the accessible range.
    #[error("index {index} out of bounds (valid range {start}..{end})")]
    IndexOutOfBounds {
        /// The offending index.
        index: usize,
        /// Start of the valid range.
        start: usize,
        /// End of the valid range (exclusive).
        end: usize,
    },

    /// Write attempted on a read-only view.
    #[error("buffer is read-only")]
    ReadOnly,

    /// A write would exceed the configured maximum capacity.
    #[error("write of {requested} bytes at writer index {writer} exceeds max capacity {max}")]
    CapacityExceeded {
        /// Bytes the caller asked to write.
        requested: usize,
        /// Writer index at the time of the request.
        writer: usize,
        /// Configured maximum capacity.
        max: usize,
    },

    /// Storage reallocation requires an exclusive handle; aliased slices would
    /// observe the move.
    #[error("cannot expand storage shared by {refs} handles")]
    AliasedExpand {
        /// Reference count observed at the time of the request.
        refs: usize,
    },

    /// A composite buffer is at its component limit.
    #[error("too many components (max: {max})")]
    TooManyComponents {
        /// Configured component limit.
        max: usize,
    },
}

impl BufError {
    /// Returns `true` if this error indicates a reference-count misuse rather
    /// than a recoverable bounds problem.
    #[inline]
    pub fn is_ref_count(&self) -> bool {
        matches!(self, Self::IllegalRefCount { .. })
    }
}
