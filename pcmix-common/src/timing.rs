//! Duration ↔ byte-offset conversions
//!
//! Byte offsets are derived from a duration with `o = d·F·R / 1s`, truncated
//! and then snapped down to a frame boundary. The inverse rounds up to the
//! next nanosecond, so converting an aligned offset to a duration and back
//! yields the same offset at every sample rate.
//!
//! ```rust
//! use pcmix_common::timing::{bytes_to_duration, duration_to_bytes};
//! use pcmix_common::{SampleFormat, StreamFormat};
//! use std::time::Duration;
//!
//! let format = StreamFormat::new(44100, SampleFormat::Int16);
//! assert_eq!(duration_to_bytes(Duration::from_secs(1), &format), 176_400);
//! assert_eq!(bytes_to_duration(176_400, &format), Duration::from_secs(1));
//! ```

use crate::format::StreamFormat;
use std::time::Duration;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Byte offset reached after playing `duration`, aligned down to a frame.
pub fn duration_to_bytes(duration: Duration, format: &StreamFormat) -> u64 {
    let frame = format.frame_size() as u128;
    let offset = duration.as_nanos() * frame * format.sample_rate as u128 / NANOS_PER_SEC;
    let aligned = offset - offset % frame;
    u64::try_from(aligned).unwrap_or(u64::MAX - (u64::MAX % frame as u64))
}

/// Playback time covered by `bytes`, rounded up to the next nanosecond.
pub fn bytes_to_duration(bytes: u64, format: &StreamFormat) -> Duration {
    let per_second = format.bytes_per_second() as u128;
    if per_second == 0 {
        return Duration::ZERO;
    }
    let nanos = (bytes as u128 * NANOS_PER_SEC).div_ceil(per_second);
    duration_from_nanos(nanos)
}

/// Playback time covered by `frames` at the stream's rate.
pub fn frames_to_duration(frames: u64, format: &StreamFormat) -> Duration {
    bytes_to_duration(frames * format.frame_size() as u64, format)
}

/// Buffer size in bytes for a latency expressed in milliseconds, aligned to a frame.
pub fn buffer_bytes_for_millis(millis: u64, format: &StreamFormat) -> usize {
    duration_to_bytes(Duration::from_millis(millis), format) as usize
}

fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = (nanos / NANOS_PER_SEC) as u64;
    let sub = (nanos % NANOS_PER_SEC) as u32;
    Duration::new(secs, sub)
}
