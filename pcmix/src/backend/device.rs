//! Output device abstraction
//!
//! A [`Device`] is a queue of interleaved PCM bytes drained by the OS at the
//! device's sample rate. Backend dialects differ only in how they keep that
//! queue fed; every one of them talks to the device through this trait, so
//! platform types never leak into the mixer or the players.
//!
//! [`DeviceError`] variants mirror the platform conditions the dialects react
//! to: an ALSA `EPIPE` is [`DeviceError::Underrun`], `ENOSYS` is
//! [`DeviceError::NotSupported`], the WinMM "element not found" code is
//! [`DeviceError::NotFound`], and a transient AudioToolbox start failure is
//! [`DeviceError::Busy`].

use crate::error::Error;
use pcmix_common::SampleFormat;
use std::sync::Arc;
use thiserror::Error;

/// Callback fired by a device whenever it consumed queued bytes.
pub type Notifier = Arc<dyn Fn() + Send + Sync>;

/// Parameters a device is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    /// Queue capacity in bytes
    pub buffer_bytes: usize,
}

impl DeviceFormat {
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }

    pub fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.sample_rate as usize
    }
}

/// Device-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device ran dry since the last prepare; nothing was written
    #[error("device underrun")]
    Underrun,

    /// The operation is not available on this device
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// The device is gone or was never present
    #[error("device not found: {0}")]
    NotFound(String),

    /// Temporarily unavailable; retrying shortly may succeed
    #[error("device busy")]
    Busy,

    /// The device has been closed
    #[error("device closed")]
    Closed,

    /// Any other platform error
    #[error("{0}")]
    Backend(String),
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::NotFound(name) => Error::DeviceNotFound(name),
            other => Error::BackendRuntime(other.to_string()),
        }
    }
}

/// Convert an open failure into the error a backend constructor returns.
pub(crate) fn init_error(err: DeviceError) -> Error {
    match err {
        DeviceError::NotFound(name) => Error::DeviceNotFound(name),
        other => Error::BackendInit(other.to_string()),
    }
}

/// A PCM output queue.
pub trait Device: Send {
    fn format(&self) -> DeviceFormat;

    /// Begin draining the queue.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Queue `data` for playback, blocking while the queue is full.
    ///
    /// Returns the number of bytes queued, which is all of `data` on success.
    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError>;

    /// Bytes queued but not yet played.
    fn queued_bytes(&self) -> usize;

    /// Total bytes played since the device was opened.
    fn played_bytes(&self) -> u64;

    /// Install the callback fired when queued bytes are consumed.
    fn set_notifier(&mut self, notifier: Notifier);

    /// Recover from an underrun so writes are accepted again.
    fn prepare(&mut self) -> Result<(), DeviceError>;

    /// Stop draining, keeping queued bytes.
    fn pause(&mut self) -> Result<(), DeviceError>;

    /// Continue draining after [`Device::pause`].
    fn resume(&mut self) -> Result<(), DeviceError>;

    /// Discard queued bytes.
    fn drop_queued(&mut self) -> Result<(), DeviceError>;

    /// Release the device. Later calls are no-ops.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Opens devices; one per backend for mixed-stream dialects, one per player
/// for the native dialect.
pub trait DeviceFactory: Send + Sync {
    fn open(&self, format: DeviceFormat) -> Result<Box<dyn Device>, DeviceError>;

    /// Human-readable name for logs.
    fn name(&self) -> String;
}
