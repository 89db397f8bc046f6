//! Error types for the ingestion core.
//!
//! Parse, resolve and convert failures are local to one buffer: the session logs them,
//! releases the buffer and keeps the last good frame live. Only `TransportError`
//! is surfaced to the caller of `IngestSession::reconfigure`.

use thiserror::Error;

/// Structural failure of the capability descriptor grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A field rule could not be compiled. Reported once for the whole descriptor.
    #[error("invalid field rule '{key}': {reason}")]
    InvalidRule { key: String, reason: &'static str },

    /// The descriptor has no media family token.
    #[error("capability descriptor has no media family")]
    MissingFamily,

    /// A recognized field carries a value that cannot be read.
    #[error("field '{key}' has unreadable value '{value}'")]
    InvalidValue { key: String, value: String },
}

/// Why a parsed format has no supported pixel layout.
///
/// This is a routine outcome for streams this crate does not handle, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Unsupported {
    #[error("media family '{0}' is not supported")]
    Family(String),

    #[error("rgb depth {0:?} is not supported (expected 24 bpp)")]
    Depth(Option<u32>),

    #[error("yuv stream has no format tag")]
    MissingFourcc,

    #[error("yuv format '{0}' is not supported")]
    Fourcc(String),

    #[error("stream geometry is missing width or height")]
    MissingDimension,

    #[error("stream geometry {width}x{height} has a zero dimension")]
    ZeroDimension { width: u32, height: u32 },

    #[error("4:2:0 geometry {width}x{height} must have even dimensions")]
    OddDimensions { width: u32, height: u32 },
}

/// Conversion refused before any byte was written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConvertError {
    /// The delivered buffer is shorter than the declared geometry requires.
    #[error("buffer holds {actual} bytes, layout needs {expected}")]
    ShortBuffer { expected: usize, actual: usize },

    #[error("frame dimensions {width}x{height} overflow the address space")]
    Overflow { width: u32, height: u32 },

    #[error("4:2:0 frame {width}x{height} must have even dimensions")]
    OddDimensions { width: u32, height: u32 },
}

/// Failure reported by a transport backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("subscribe to '{source_id}' failed: {reason}")]
    Subscribe { source_id: String, reason: String },

    #[error("unsubscribe of subscription {id} failed: {reason}")]
    Unsubscribe { id: u64, reason: String },

    #[error("write to '{destination}' failed: {reason}")]
    Write { destination: String, reason: String },
}
