//! Stereo pan transformer
//!
//! Scales the left and right channels of every frame:
//! `ls = min(1, 1 - pan)`, `rs = min(1, 1 + pan)` with `pan ∈ [-1, 1]`.
//! A centered pan leaves the signal untouched; a hard pan silences the
//! opposite channel.

use crate::audio::source::{ReadOutcome, Source, SourceId};
use crate::error::Result;
use pcmix_common::{SampleFormat, StreamFormat};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Left channel gain for `pan`.
pub fn left_scale(pan: f64) -> f64 {
    (1.0 - clamp_pan(pan)).min(1.0)
}

/// Right channel gain for `pan`.
pub fn right_scale(pan: f64) -> f64 {
    (1.0 + clamp_pan(pan)).min(1.0)
}

fn clamp_pan(pan: f64) -> f64 {
    if pan.is_nan() {
        0.0
    } else {
        pan.clamp(-1.0, 1.0)
    }
}

/// Shared pan value, adjustable while the stream is owned by a player.
#[derive(Debug, Clone, Default)]
pub struct PanHandle {
    bits: Arc<AtomicU64>,
}

impl PanHandle {
    pub fn new(pan: f64) -> Self {
        let handle = Self::default();
        handle.set(pan);
        handle
    }

    /// Set the pan, clamped to [-1, 1].
    pub fn set(&self, pan: f64) {
        self.bits.store(clamp_pan(pan).to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Source wrapper applying a stereo pan to whole frames.
pub struct StereoPan<S> {
    src: S,
    sample_format: SampleFormat,
    pan: PanHandle,
    carry: Vec<u8>,
}

impl<S: Source> StereoPan<S> {
    pub fn new(src: S, sample_format: SampleFormat) -> Self {
        Self {
            src,
            sample_format,
            pan: PanHandle::new(0.0),
            carry: Vec::new(),
        }
    }

    pub fn set_pan(&self, pan: f64) {
        self.pan.set(pan);
    }

    pub fn pan(&self) -> f64 {
        self.pan.get()
    }

    /// Handle for adjusting the pan after the stream is moved into a player.
    pub fn handle(&self) -> PanHandle {
        self.pan.clone()
    }

    fn apply(&self, frames: &mut [u8]) {
        let pan = self.pan.get();
        if pan == 0.0 {
            return;
        }
        let (ls, rs) = (left_scale(pan), right_scale(pan));
        match self.sample_format {
            SampleFormat::Int16 => {
                for frame in frames.chunks_exact_mut(4) {
                    scale_i16(&mut frame[0..2], ls);
                    scale_i16(&mut frame[2..4], rs);
                }
            }
            SampleFormat::Float32 => {
                for frame in frames.chunks_exact_mut(8) {
                    scale_f32(&mut frame[0..4], ls);
                    scale_f32(&mut frame[4..8], rs);
                }
            }
        }
    }
}

fn scale_i16(sample: &mut [u8], gain: f64) {
    let v = i16::from_le_bytes([sample[0], sample[1]]);
    let scaled = (v as f64 * gain) as i16;
    sample.copy_from_slice(&scaled.to_le_bytes());
}

fn scale_f32(sample: &mut [u8], gain: f64) {
    let v = f32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
    let scaled = (v as f64 * gain) as f32;
    sample.copy_from_slice(&scaled.to_le_bytes());
}

impl<S: Source> Source for StereoPan<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let frame = self.sample_format.frame_size();
        let mut n = self.carry.len().min(buf.len());
        buf[..n].copy_from_slice(&self.carry[..n]);
        self.carry.drain(..n);

        let mut end = false;
        if n < buf.len() {
            let outcome = self.src.read(&mut buf[n..])?;
            n += outcome.n;
            end = outcome.end;
        }

        // Hold back a trailing partial frame unless the stream is over.
        let rem = n % frame;
        if rem > 0 && !end {
            let mut held = buf[n - rem..n].to_vec();
            held.extend_from_slice(&self.carry);
            self.carry = held;
            n -= rem;
        }
        self.apply(&mut buf[..n - n % frame]);
        Ok(ReadOutcome {
            n,
            end: end && self.carry.is_empty(),
        })
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        // The wrapped source is ahead of our caller by the held-back bytes.
        let pos = match pos {
            SeekFrom::Current(delta) => SeekFrom::Current(delta - self.carry.len() as i64),
            other => other,
        };
        let target = self.src.seek(pos)?;
        self.carry.clear();
        Ok(target)
    }

    fn close(&mut self) -> Result<()> {
        self.src.close()
    }

    fn format(&self) -> Option<StreamFormat> {
        self.src.format()
    }

    fn identity(&self) -> Option<SourceId> {
        self.src.identity()
    }
}
