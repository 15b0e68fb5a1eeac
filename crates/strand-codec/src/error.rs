//! Error types for codecs and supervisors.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by decoders and the timeout supervisors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A decode callback failed.
    #[error("decoder failure: {message}")]
    Decoder {
        /// Human-readable failure description.
        message: String,
    },

    /// A decoder produced output without consuming any input. Tolerating
    /// this would spin the decode loop forever on the same bytes.
    #[error("decoder produced a message without reading anything")]
    DecoderNoProgress,

    /// Input exceeded the framer's configured maximum.
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLong {
        /// Observed (or accumulated) frame length.
        length: usize,
        /// The configured limit.
        max: usize,
    },

    /// A write did not complete within the supervisor's deadline.
    #[error("write timed out after {timeout:?}")]
    WriteTimeout {
        /// The configured timeout.
        timeout: Duration,
    },
}

impl CodecError {
    /// Wraps a buffer error observed inside a decode callback.
    pub fn from_buf(error: strand_buf::BufError) -> Self {
        CodecError::Decoder {
            message: error.to_string(),
        }
    }
}
