//! Backend dialects
//!
//! A backend turns players into sound. Three dialects feed one mixed stream
//! to a single device and differ only in how they pace the writes:
//!
//! - [`BackendKind::Blocking`]: zero a staging buffer, mix, write, repeat;
//!   the write blocks while the device queue is full
//! - [`BackendKind::Ring`]: a ring of prepared headers, refilled as the
//!   device reports each one played
//! - [`BackendKind::Callback`]: a queue of float buffers handed back by the
//!   device's "buffer consumed" callback
//!
//! The fourth, [`BackendKind::Native`], gives every player its own device
//! and filler thread, so the mixer collapses to bookkeeping.
//!
//! All dialects talk to hardware through [`Device`], so they run unchanged
//! over cpal or the in-memory device.

pub mod blocking;
pub mod callback;
pub mod cpal_device;
pub mod device;
mod driver;
pub mod memory;
mod mixed;
pub mod native;
pub mod ring;

pub use cpal_device::{CpalDevice, CpalDeviceFactory};
pub use device::{Device, DeviceError, DeviceFactory, DeviceFormat, Notifier};
pub use memory::{MemoryDevice, MemoryDeviceFactory, MemoryDeviceHandle, MemoryDeviceOptions};

use crate::audio::TimeStream;
use crate::error::{Error, Result};
use crate::playback::PlayerId;
use pcmix_common::config::BackendSetting;
use pcmix_common::timing::duration_to_bytes;
use pcmix_common::{SampleFormat, StreamFormat};
use std::fmt;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Default device buffer latency
pub const DEFAULT_BUFFER: Duration = Duration::from_millis(100);

/// Backend dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Blocking,
    Ring,
    Callback,
    Native,
}

impl BackendKind {
    /// The dialect the current platform's audio API is shaped like.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            BackendKind::Ring
        } else if cfg!(any(target_os = "macos", target_os = "ios")) {
            BackendKind::Callback
        } else if cfg!(any(target_os = "android", target_arch = "wasm32")) {
            BackendKind::Native
        } else {
            BackendKind::Blocking
        }
    }

    /// Sample format written to the device when none is configured.
    pub fn default_output_format(self) -> SampleFormat {
        match self {
            BackendKind::Ring => SampleFormat::Int16,
            BackendKind::Blocking | BackendKind::Callback | BackendKind::Native => {
                SampleFormat::Float32
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Blocking => "blocking",
            BackendKind::Ring => "ring",
            BackendKind::Callback => "callback",
            BackendKind::Native => "native",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<BackendSetting> for BackendKind {
    fn from(setting: BackendSetting) -> Self {
        match setting {
            BackendSetting::Auto => BackendKind::platform_default(),
            BackendSetting::Blocking => BackendKind::Blocking,
            BackendSetting::Ring => BackendKind::Ring,
            BackendSetting::Callback => BackendKind::Callback,
            BackendSetting::Native => BackendKind::Native,
        }
    }
}

/// Backend construction parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Device sample format; `None` uses the dialect's default.
    /// The callback and native dialects always write float32.
    pub output_format: Option<SampleFormat>,
    /// Device buffer latency
    pub buffer: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::platform_default(),
            output_format: None,
            buffer: DEFAULT_BUFFER,
        }
    }
}

impl BackendConfig {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn with_output_format(mut self, format: SampleFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    pub fn with_buffer(mut self, buffer: Duration) -> Self {
        self.buffer = buffer;
        self
    }

    /// Device sample format this configuration resolves to.
    pub fn resolved_output_format(&self) -> SampleFormat {
        match self.kind {
            BackendKind::Callback | BackendKind::Native => SampleFormat::Float32,
            kind => self.output_format.unwrap_or(kind.default_output_format()),
        }
    }
}

/// Device parameters for a stream at `format`'s rate written as `output`.
pub(crate) fn device_format(
    format: &StreamFormat,
    output: SampleFormat,
    buffer: Duration,
) -> DeviceFormat {
    let out = StreamFormat::new(format.sample_rate, output);
    let bytes = duration_to_bytes(buffer, &out) as usize;
    DeviceFormat {
        sample_rate: format.sample_rate,
        channels: out.channels,
        sample_format: output,
        buffer_bytes: bytes.max(out.frame_size()),
    }
}

/// An audio sink owned by the context.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Bind `stream` to a new backend player, initially paused.
    fn new_player(&self, id: PlayerId, stream: Arc<TimeStream>) -> Result<Arc<dyn BackendPlayer>>;

    /// Stop output when the host loses audio focus. Never fails on devices
    /// that cannot pause.
    fn suspend(&self) -> Result<()>;

    /// Restart output after [`Backend::suspend`], retrying transient errors.
    fn resume(&self) -> Result<()>;

    /// First persistent failure, if any.
    fn err(&self) -> Option<Error>;

    /// Stop the backend loop and release the device. Idempotent.
    fn close(&self) -> Result<()>;
}

/// Backend side of a player.
pub trait BackendPlayer: Send + Sync {
    fn play(&self) -> Result<()>;
    fn pause(&self);
    fn is_playing(&self) -> bool;

    /// Pause and discard everything buffered.
    fn reset(&self);

    fn volume(&self) -> f64;
    fn set_volume(&self, volume: f64);

    /// Bytes taken from the stream but not yet played, in stream bytes.
    fn buffered_size(&self) -> usize;

    /// Latched source or device error.
    fn err(&self) -> Option<Error>;

    /// Preferred buffering depth in stream bytes.
    fn set_buffer_size(&self, bytes: usize);

    /// Seek the stream, discarding buffered bytes.
    fn seek(&self, pos: SeekFrom) -> Result<u64>;

    fn close(&self) -> Result<()>;

    /// The owning handle went away while playing: keep playing and close the
    /// stream once it ends.
    fn detach(&self);
}

/// Open the backend dialect `config` asks for.
pub fn open_backend(
    config: &BackendConfig,
    format: StreamFormat,
    factory: Arc<dyn DeviceFactory>,
) -> Result<Arc<dyn Backend>> {
    info!(
        "Opening {} backend on '{}' ({}, {:?} buffer)",
        config.kind,
        factory.name(),
        format,
        config.buffer
    );
    let backend: Arc<dyn Backend> = match config.kind {
        BackendKind::Blocking => blocking::open(config, format, factory)?,
        BackendKind::Ring => ring::open(config, format, factory)?,
        BackendKind::Callback => callback::open(config, format, factory)?,
        BackendKind::Native => Arc::new(native::NativeBackend::new(config, format, factory)),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_setting_maps_to_platform_default() {
        assert_eq!(
            BackendKind::from(BackendSetting::Auto),
            BackendKind::platform_default()
        );
        assert_eq!(BackendKind::from(BackendSetting::Ring), BackendKind::Ring);
    }

    #[test]
    fn test_output_format_resolution() {
        let ring = BackendConfig::new(BackendKind::Ring);
        assert_eq!(ring.resolved_output_format(), SampleFormat::Int16);
        let ring = ring.with_output_format(SampleFormat::Float32);
        assert_eq!(ring.resolved_output_format(), SampleFormat::Float32);

        let callback = BackendConfig::new(BackendKind::Callback).with_output_format(SampleFormat::Int16);
        assert_eq!(callback.resolved_output_format(), SampleFormat::Float32);
    }

    #[test]
    fn test_device_format_buffer_is_frame_aligned() {
        let format = StreamFormat::new(44100, SampleFormat::Int16);
        let device = device_format(&format, SampleFormat::Float32, Duration::from_millis(10));
        assert_eq!(device.sample_format, SampleFormat::Float32);
        assert_eq!(device.buffer_bytes, 441 * 8);
        assert_eq!(device.buffer_bytes % device.frame_size(), 0);

        let tiny = device_format(&format, SampleFormat::Int16, Duration::ZERO);
        assert_eq!(tiny.buffer_bytes, 4);
    }
}
