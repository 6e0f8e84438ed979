//! PCM sample format vocabulary
//!
//! Every byte stream crossing a component boundary is interleaved
//! little-endian stereo PCM in one of two sample depths:
//!
//! | Format    | Bytes/sample | Frame size F |
//! |-----------|--------------|--------------|
//! | `Int16`   | 2            | 4            |
//! | `Float32` | 4            | 8            |
//!
//! Offsets and lengths exchanged between components are multiples of F.

use crate::error::Error;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Channel count of every stream (interleaved stereo).
pub const CHANNELS: usize = 2;

/// Sample depth of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Signed 16-bit little-endian integer samples
    #[default]
    Int16,
    /// IEEE-754 32-bit little-endian float samples
    Float32,
}

impl SampleFormat {
    /// Bytes occupied by one sample of one channel.
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Int16 => 2,
            SampleFormat::Float32 => 4,
        }
    }

    /// Bytes occupied by one stereo frame.
    pub const fn frame_size(self) -> usize {
        CHANNELS * self.bytes_per_sample()
    }

    pub const fn name(self) -> &'static str {
        match self {
            SampleFormat::Int16 => "int16",
            SampleFormat::Float32 => "float32",
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "int16" | "i16" | "s16le" => Ok(SampleFormat::Int16),
            "float32" | "f32" | "f32le" => Ok(SampleFormat::Float32),
            other => Err(Error::InvalidInput(format!("unknown sample format '{}'", other))),
        }
    }
}

/// Complete description of a PCM stream: rate, channel count and sample depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl StreamFormat {
    /// Stereo stream at the given rate and depth.
    pub const fn new(sample_rate: u32, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels: CHANNELS as u16,
            sample_format,
        }
    }

    /// Frame size F in bytes.
    pub const fn frame_size(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }

    pub const fn bytes_per_second(&self) -> usize {
        self.frame_size() * self.sample_rate as usize
    }

    /// Round `len` down to a multiple of the frame size.
    pub const fn align_down(&self, len: usize) -> usize {
        len - len % self.frame_size()
    }

    /// True when `offset` is a multiple of the frame size.
    pub const fn is_aligned(&self, offset: u64) -> bool {
        offset % self.frame_size() as u64 == 0
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}",
            self.sample_rate, self.channels, self.sample_format
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        assert_eq!(SampleFormat::Int16.frame_size(), 4);
        assert_eq!(SampleFormat::Float32.frame_size(), 8);
        assert_eq!(StreamFormat::new(44100, SampleFormat::Int16).frame_size(), 4);
        assert_eq!(StreamFormat::new(48000, SampleFormat::Float32).frame_size(), 8);
    }

    #[test]
    fn test_align_down() {
        let format = StreamFormat::new(44100, SampleFormat::Int16);
        assert_eq!(format.align_down(0), 0);
        assert_eq!(format.align_down(7), 4);
        assert_eq!(format.align_down(8), 8);
        assert!(format.is_aligned(4096));
        assert!(!format.is_aligned(4093));
    }

    #[test]
    fn test_parse_sample_format() {
        assert_eq!("int16".parse::<SampleFormat>().unwrap(), SampleFormat::Int16);
        assert_eq!("F32".parse::<SampleFormat>().unwrap(), SampleFormat::Float32);
        assert!("u8".parse::<SampleFormat>().is_err());
    }

    #[test]
    fn test_display() {
        let format = StreamFormat::new(48000, SampleFormat::Float32);
        assert_eq!(format.to_string(), "48000 Hz, 2 ch, float32");
    }
}
