//! Protocol-level errors for frame processing
//!
//! Every variant describes why a single frame could not be read. Callers
//! treat any of them as fatal for the connection the frame arrived on and
//! for nothing else.

use thiserror::Error;

/// Frame decoding errors with diagnostic context
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// The stream or buffer ended before the declared frame was complete
    #[error("Short read: need {need} bytes, got {got} (context: {context})")]
    ShortRead {
        need: usize,
        got: usize,
        context: String,
    },

    /// Declared length cannot hold the fixed fields for its frame type
    #[error("Bad length {length}: {frame_type} frames need at least {minimum}")]
    BadLength {
        length: u32,
        minimum: u32,
        frame_type: &'static str,
    },

    /// Declared length exceeds the configured ceiling
    #[error("Frame too large: {length} bytes exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },

    /// Type tag is neither request (0) nor response (1)
    #[error("Unknown type tag {tag}: valid tags are 0 (request) and 1 (response)")]
    UnknownTypeTag { tag: u8 },

    /// Underlying stream failed for a reason other than end-of-stream
    #[error("I/O error during {operation}: {message}")]
    Io {
        operation: String,
        kind: std::io::ErrorKind,
        message: String,
    },
}

/// Result type for codec operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Create ShortRead error
    pub fn short_read(need: usize, got: usize, context: impl Into<String>) -> Self {
        Self::ShortRead {
            need,
            got,
            context: context.into(),
        }
    }

    /// Create BadLength error
    pub fn bad_length(length: u32, minimum: usize, frame_type: &'static str) -> Self {
        Self::BadLength {
            length,
            minimum: minimum as u32,
            frame_type,
        }
    }

    /// Create FrameTooLarge error
    pub fn frame_too_large(length: usize, max: usize) -> Self {
        Self::FrameTooLarge { length, max }
    }

    /// Create UnknownTypeTag error
    pub fn unknown_type_tag(tag: u8) -> Self {
        Self::UnknownTypeTag { tag }
    }

    /// Map a stream error, folding end-of-stream into ShortRead
    pub fn from_io(operation: &str, need: usize, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Self::short_read(need, 0, operation);
        }
        Self::Io {
            operation: operation.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// True when the peer closed the stream before or inside a frame
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::ShortRead { .. })
    }
}
