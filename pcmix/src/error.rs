//! Error types for pcmix
//!
//! Errors are `Clone` so a latched failure can be handed out by every later
//! `err()` call; I/O errors are shared behind an `Arc`.

use pcmix_common::StreamFormat;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Main error type for the pcmix library
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Source format does not match the context
    #[error("Format mismatch: source is {actual}, context is {expected}")]
    FormatMismatch {
        expected: StreamFormat,
        actual: StreamFormat,
    },

    /// Underlying source read, seek or close failed
    #[error("Source I/O error: {0}")]
    SourceIo(#[source] Arc<std::io::Error>),

    /// Audio device could not be opened or configured
    #[error("Backend initialization failed: {0}")]
    BackendInit(String),

    /// Audio device disappeared or was never present
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// Persistent backend failure after recovery attempts
    #[error("Backend error: {0}")]
    BackendRuntime(String),

    /// A second context was requested while one is alive
    #[error("An audio context already exists in this process")]
    ContextExists,

    /// Context has been closed; no new players may be created
    #[error("Audio context is closed")]
    ContextClosed,

    /// Volume outside [0, 1], including NaN
    #[error("Volume {0} out of range [0, 1]")]
    VolumeOutOfRange(f64),

    /// Seek origin not supported by this stream
    #[error("Unsupported seek origin: {0}")]
    WhenceUnsupported(&'static str),

    /// Seek resolved to a negative position
    #[error("Bad seek position: {0}")]
    BadPosition(i64),

    /// Offset is not a multiple of the frame size
    #[error("Offset {offset} is not aligned to frame size {frame_size}")]
    Misaligned { offset: i64, frame_size: usize },

    /// Source is already attached to another player
    #[error("Source is already used by another player")]
    SourceShared,

    /// Source does not support seeking
    #[error("Source is not seekable")]
    NotSeekable,

    /// Operation on a closed player
    #[error("Player is closed")]
    PlayerClosed,

    /// Loop parameters do not describe a playable region
    #[error("Invalid loop: {0}")]
    InvalidLoop(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Convenience Result type using pcmix Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::SourceIo(Arc::new(err))
    }
}

impl From<pcmix_common::Error> for Error {
    fn from(err: pcmix_common::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// First-error-wins latch shared between a loop and its callers.
#[derive(Debug, Default)]
pub(crate) struct ErrorLatch {
    slot: Mutex<Option<Error>>,
}

impl ErrorLatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Store `err` unless an error is already latched.
    pub(crate) fn set(&self, err: Error) {
        let mut slot = crate::sync::lock(&self.slot);
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn get(&self) -> Option<Error> {
        crate::sync::lock(&self.slot).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latch_keeps_first_error() {
        let latch = ErrorLatch::new();
        assert!(latch.get().is_none());
        latch.set(Error::PlayerClosed);
        latch.set(Error::ContextClosed);
        assert!(matches!(latch.get(), Some(Error::PlayerClosed)));
    }

    #[test]
    fn test_io_error_is_clone() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short").into();
        let copy = err.clone();
        assert!(copy.to_string().contains("short"));
    }
}
