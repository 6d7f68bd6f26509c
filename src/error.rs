//! Error types for the conversion engine.
//!
//! Every failure the engine can produce is a [`ConvertError`], and every
//! `ConvertError` maps onto exactly one [`ErrorKind`] of the public taxonomy.

use crate::chunk::Chunk;
use crate::format::Format;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Closed error taxonomy surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    UnsupportedFormat,
    UnsupportedRoute,
    InvalidOptions,
    SizeError,
    MemoryError,
    TimeoutError,
    ConversionFailed,
    ProcessingError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorKind::UnsupportedRoute => "UNSUPPORTED_ROUTE",
            ErrorKind::InvalidOptions => "INVALID_OPTIONS",
            ErrorKind::SizeError => "SIZE_ERROR",
            ErrorKind::MemoryError => "MEMORY_ERROR",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::ConversionFailed => "CONVERSION_FAILED",
            ErrorKind::ProcessingError => "PROCESSING_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by an injected codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The host cannot handle this format at all.
    #[error("codec unavailable for {0}")]
    Unavailable(Format),

    #[error("failed to decode {format}: {message}")]
    Decode { format: Format, message: String },

    #[error("failed to encode {format}: {message}")]
    Encode { format: Format, message: String },
}

/// Errors produced while validating, routing or executing a conversion.
#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("no conversion route from {from} to {to}")]
    UnsupportedRoute { from: Format, to: Format },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Resolved output dimensions exceed the configured per-side maximum.
    #[error("output size {width}x{height} exceeds maximum dimension {max}")]
    SizeLimit { width: u32, height: u32, max: u32 },

    #[error("memory budget exceeded: {used} of {cap} bytes in use")]
    Memory { used: u64, cap: u64 },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Cancelled by the caller's token rather than by the governor timeout.
    #[error("conversion cancelled")]
    Cancelled,

    #[error("tile {chunk} failed: {source}")]
    TileFailed {
        chunk: Chunk,
        #[source]
        source: CodecError,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("processing error: {0}")]
    Processing(String),
}

impl ConvertError {
    /// Maps this error onto the public taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvertError::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            ConvertError::UnsupportedRoute { .. } => ErrorKind::UnsupportedRoute,
            ConvertError::InvalidOptions(_) => ErrorKind::InvalidOptions,
            ConvertError::SizeLimit { .. } => ErrorKind::SizeError,
            ConvertError::Memory { .. } => ErrorKind::MemoryError,
            ConvertError::Timeout(_) => ErrorKind::TimeoutError,
            ConvertError::TileFailed { .. } => ErrorKind::ConversionFailed,
            ConvertError::Codec(CodecError::Unavailable(_)) => ErrorKind::ProcessingError,
            ConvertError::Codec(_) => ErrorKind::ConversionFailed,
            ConvertError::Cancelled | ConvertError::Processing(_) => ErrorKind::ProcessingError,
        }
    }

    /// Validation failures are raised before any buffer is allocated.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UnsupportedFormat | ErrorKind::UnsupportedRoute | ErrorKind::InvalidOptions
        )
    }

    /// Failures that must never be retried automatically or manually.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConvertError::Codec(CodecError::Unavailable(_)) | ConvertError::Cancelled
        )
    }

    /// The tile a chunked stage was working on when it failed, if any.
    pub fn chunk(&self) -> Option<Chunk> {
        match self {
            ConvertError::TileFailed { chunk, .. } => Some(*chunk),
            _ => None,
        }
    }
}
