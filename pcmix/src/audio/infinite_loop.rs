//! Seekable endless stream built from a finite source
//!
//! The stream plays `intro` bytes once, then repeats the region
//! `[intro, intro + loop)` forever by re-seeking the underlying source each
//! time a read reaches the end of the loop body.
//!
//! ```text
//! |---- intro ----|------ loop ------|
//!                 ^                  |
//!                 +------------------+
//! ```
//!
//! Positions are byte offsets into the logical (unbounded) stream, folded
//! back into the loop region whenever they fall at or beyond `intro`.
//!
//! If the source has data past the loop end, up to [`BLEND_FRAMES`] frames
//! of it are captured the first time the loop end is reached. From then on
//! the start of every repeat is crossfaded from that tail into the loop
//! body, which hides small discontinuities at the joint (typical of lossy
//! decoders). A seek turns the crossfade off until the loop end is passed
//! again.

use crate::audio::source::{ReadOutcome, Source, SourceId};
use crate::error::{Error, Result};
use pcmix_common::{SampleFormat, StreamFormat};
use std::io::SeekFrom;
use tracing::{debug, trace};

/// Frames past the loop end used to smooth the loop joint
pub const BLEND_FRAMES: usize = 256;

/// Endless stream with an optional non-repeating intro.
pub struct InfiniteLoop<S> {
    src: S,
    intro: u64,
    length: u64,
    frame_size: usize,
    sample_format: SampleFormat,
    /// Underlying source position, initialized on first use
    pos: Option<u64>,
    /// Trailing partial frame held back from the previous read
    carry: Vec<u8>,
    /// Source data following the loop end; `None` until first captured
    after_loop: Option<Vec<u8>>,
    /// The current pass started at the loop joint and is being crossfaded
    blending: bool,
    blend_enabled: bool,
}

impl<S: Source> InfiniteLoop<S> {
    /// Loop the first `length` bytes of `src` with no intro.
    pub fn new(src: S, length: u64, format: SampleFormat) -> Result<Self> {
        Self::with_intro(src, 0, length, format)
    }

    /// Play `intro` bytes once, then loop the following `loop_length` bytes.
    ///
    /// Both lengths are truncated to a whole number of frames.
    ///
    /// # Errors
    /// - [`Error::InvalidLoop`] if the loop body is shorter than one frame
    pub fn with_intro(src: S, intro: u64, loop_length: u64, format: SampleFormat) -> Result<Self> {
        let frame = format.frame_size() as u64;
        let intro = intro - intro % frame;
        let loop_length = loop_length - loop_length % frame;
        if loop_length == 0 {
            return Err(Error::InvalidLoop(format!(
                "loop length must cover at least one {}-byte frame",
                frame
            )));
        }
        Ok(Self {
            src,
            intro,
            length: intro + loop_length,
            frame_size: frame as usize,
            sample_format: format,
            pos: None,
            carry: Vec::new(),
            after_loop: None,
            blending: false,
            blend_enabled: true,
        })
    }

    /// Enable or disable crossfading at the loop joint (on by default).
    pub fn with_blending(mut self, enabled: bool) -> Self {
        self.blend_enabled = enabled;
        self
    }

    pub fn intro_len(&self) -> u64 {
        self.intro
    }

    pub fn loop_len(&self) -> u64 {
        self.length - self.intro
    }

    /// Position of the next byte handed to the caller.
    pub fn position(&mut self) -> Result<u64> {
        let pos = self.ensure_pos()?;
        Ok(pos - self.carry.len() as u64)
    }

    pub fn into_inner(self) -> S {
        self.src
    }

    fn ensure_pos(&mut self) -> Result<u64> {
        if let Some(pos) = self.pos {
            return Ok(pos);
        }
        let pos = self.src.seek(SeekFrom::Current(0))?;
        if pos >= self.length {
            return Err(Error::InvalidLoop(format!(
                "source position {} is past the loop end {}",
                pos, self.length
            )));
        }
        self.pos = Some(pos);
        Ok(pos)
    }

    /// Read up to [`BLEND_FRAMES`] frames following the loop end.
    fn capture_after_loop(&mut self) -> Result<Vec<u8>> {
        let want = (BLEND_FRAMES * self.frame_size).min(self.length as usize);
        let mut after = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let outcome = self.src.read(&mut after[filled..])?;
            filled += outcome.n;
            if outcome.end || outcome.n == 0 {
                break;
            }
        }
        after.truncate(filled - filled % self.frame_size);
        debug!("Captured {} bytes past the loop end for blending", after.len());
        Ok(after)
    }

    /// Crossfade `bytes`, which start at stream position `start`, with the
    /// captured tail. The tail's weight falls linearly from 1 to 0 over its
    /// length.
    fn blend_joint(&self, start: u64, bytes: &mut [u8]) {
        let Some(after) = self.after_loop.as_deref() else {
            return;
        };
        let blend_end = self.intro + after.len() as u64;
        if start >= blend_end || start + bytes.len() as u64 <= self.intro {
            return;
        }
        let tail_frames = (after.len() / self.frame_size) as f32;
        let depth = self.sample_format.bytes_per_sample();
        for (k, sample) in bytes.chunks_exact_mut(depth).enumerate() {
            let abs = start + (k * depth) as u64;
            if abs < self.intro || abs >= blend_end {
                continue;
            }
            let rel = (abs - self.intro) as usize;
            let rate = 1.0 - (rel / self.frame_size) as f32 / tail_frames;
            let tail = &after[rel..rel + depth];
            match self.sample_format {
                SampleFormat::Int16 => {
                    let a = i16::from_le_bytes([tail[0], tail[1]]) as f32;
                    let o = i16::from_le_bytes([sample[0], sample[1]]) as f32;
                    let v = (a * rate + o * (1.0 - rate)) as i16;
                    sample.copy_from_slice(&v.to_le_bytes());
                }
                SampleFormat::Float32 => {
                    let a = f32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
                    let o = f32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                    let v = a * rate + o * (1.0 - rate);
                    sample.copy_from_slice(&v.to_le_bytes());
                }
            }
        }
    }

    fn fold(&self, pos: u64) -> u64 {
        if pos >= self.intro {
            (pos - self.intro) % (self.length - self.intro) + self.intro
        } else {
            pos
        }
    }
}

impl<S: Source> Source for InfiniteLoop<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let mut pos = self.ensure_pos()?;
        let start = pos - self.carry.len() as u64;
        // Blending switched on by this read applies from the next read.
        let blending = self.blending;

        let mut n = self.carry.len().min(buf.len());
        buf[..n].copy_from_slice(&self.carry[..n]);
        self.carry.drain(..n);

        // Never read across the loop end in one go.
        let room = (buf.len() - n).min((self.length - pos) as usize);
        if room > 0 {
            let outcome = self.src.read(&mut buf[n..n + room])?;
            n += outcome.n;
            pos += outcome.n as u64;
            if pos == self.length && !outcome.end && self.blend_enabled {
                if self.after_loop.is_none() {
                    self.after_loop = Some(self.capture_after_loop()?);
                }
                self.blending = self.after_loop.as_ref().is_some_and(|a| !a.is_empty());
            }
            if outcome.end || pos == self.length {
                trace!("Loop end reached at {}, rewinding to {}", pos, self.intro);
                self.src.seek(SeekFrom::Start(self.intro))?;
                pos = self.intro;
            }
        }
        self.pos = Some(pos);

        let rem = n % self.frame_size;
        if rem > 0 {
            let mut held = buf[n - rem..n].to_vec();
            held.extend_from_slice(&self.carry);
            self.carry = held;
            n -= rem;
        }
        if blending {
            self.blend_joint(start, &mut buf[..n]);
        }
        Ok(ReadOutcome::data(n))
    }

    /// Seek within the endless stream.
    ///
    /// # Errors
    /// - [`Error::WhenceUnsupported`] for `SeekFrom::End` (the stream has no end)
    /// - [`Error::BadPosition`] if the target is negative
    /// - [`Error::Misaligned`] if the target is not on a frame boundary
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let current = self.position()?;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => current as i128 + delta as i128,
            SeekFrom::End(_) => return Err(Error::WhenceUnsupported("end of an infinite loop")),
        };
        if target < 0 {
            return Err(Error::BadPosition(target as i64));
        }
        if target % self.frame_size as i128 != 0 {
            return Err(Error::Misaligned {
                offset: target as i64,
                frame_size: self.frame_size,
            });
        }

        let next = self.fold(target as u64);
        self.src.seek(SeekFrom::Start(next))?;
        self.carry.clear();
        self.blending = false;
        self.pos = Some(next);
        Ok(next)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::source::BytesSource;

    #[test]
    fn test_rejects_empty_loop() {
        let src = BytesSource::new(vec![0u8; 16]);
        assert!(matches!(
            InfiniteLoop::new(src, 3, SampleFormat::Int16),
            Err(Error::InvalidLoop(_))
        ));
    }

    #[test]
    fn test_lengths_truncated_to_frames() {
        let src = BytesSource::new(vec![0u8; 4096]);
        let lp = InfiniteLoop::with_intro(src, 2047, 2046, SampleFormat::Int16).unwrap();
        assert_eq!(lp.intro_len(), 2044);
        assert_eq!(lp.loop_len(), 2044);
    }

    #[test]
    fn test_read_truncates_at_loop_end() {
        let src = BytesSource::new((0u8..16).collect::<Vec<_>>());
        let mut lp = InfiniteLoop::new(src, 12, SampleFormat::Int16)
            .unwrap()
            .with_blending(false);
        let mut buf = [0u8; 16];

        let first = lp.read(&mut buf).unwrap();
        assert_eq!(first, ReadOutcome::data(12));
        assert_eq!(&buf[..12], &(0u8..12).collect::<Vec<_>>()[..]);

        let second = lp.read(&mut buf[..4]).unwrap();
        assert_eq!(second.n, 4);
        assert_eq!(&buf[..4], &[0, 1, 2, 3]);
    }

    #[test]
    fn test_seek_end_unsupported() {
        let src = BytesSource::new(vec![0u8; 64]);
        let mut lp = InfiniteLoop::new(src, 64, SampleFormat::Int16).unwrap();
        assert!(matches!(
            lp.seek(SeekFrom::End(0)),
            Err(Error::WhenceUnsupported(_))
        ));
    }

    #[test]
    fn test_seek_rejects_misaligned() {
        let src = BytesSource::new(vec![0u8; 64]);
        let mut lp = InfiniteLoop::new(src, 64, SampleFormat::Float32).unwrap();
        assert!(matches!(
            lp.seek(SeekFrom::Start(12)),
            Err(Error::Misaligned { offset: 12, frame_size: 8 })
        ));
        assert_eq!(lp.seek(SeekFrom::Start(72)).unwrap(), 8);
    }

    /// Source that hands out one byte at a time to exercise the frame carry.
    struct Trickle(BytesSource);

    impl Source for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
            let len = buf.len().min(3);
            self.0.read(&mut buf[..len])
        }

        fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
            self.0.seek(pos)
        }
    }

    #[test]
    fn test_short_reads_stay_frame_aligned() {
        let data: Vec<u8> = (0u8..8).collect();
        let mut lp = InfiniteLoop::new(Trickle(BytesSource::new(data)), 8, SampleFormat::Int16).unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 8];
        while out.len() < 24 {
            let outcome = lp.read(&mut buf).unwrap();
            assert_eq!(outcome.n % 4, 0, "read returned {} bytes", outcome.n);
            assert!(!outcome.end);
            out.extend_from_slice(&buf[..outcome.n]);
        }
        let expected: Vec<u8> = (0..out.len()).map(|i| (i % 8) as u8).collect();
        assert_eq!(out, expected);
    }

    /// Eight silent frames of loop body followed by four frames of `tail`.
    fn loop_with_tail(silence: &[u8], tail: &[u8]) -> Vec<u8> {
        let mut data = silence.repeat(16);
        data.extend(tail.repeat(8));
        data
    }

    #[test]
    fn test_joint_blends_tail_into_loop_start_int16() {
        let data = loop_with_tail(&0i16.to_le_bytes(), &1000i16.to_le_bytes());
        let mut lp = InfiniteLoop::new(BytesSource::new(data), 32, SampleFormat::Int16).unwrap();
        let mut buf = [0u8; 32];

        // First pass is untouched; reaching the loop end captures the tail.
        assert_eq!(lp.read(&mut buf).unwrap().n, 32);
        assert!(buf.iter().all(|&b| b == 0));

        assert_eq!(lp.read(&mut buf).unwrap().n, 32);
        let samples: Vec<i16> = buf
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(
            samples,
            [1000, 1000, 750, 750, 500, 500, 250, 250, 0, 0, 0, 0, 0, 0, 0, 0]
        );

        // A seek stops blending until the loop end comes round again.
        lp.seek(SeekFrom::Start(0)).unwrap();
        lp.read(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_joint_blends_tail_into_loop_start_float32() {
        let data = loop_with_tail(&0f32.to_le_bytes(), &0.5f32.to_le_bytes());
        let mut lp = InfiniteLoop::new(BytesSource::new(data), 64, SampleFormat::Float32).unwrap();
        let mut buf = [0u8; 64];

        assert_eq!(lp.read(&mut buf).unwrap().n, 64);
        assert_eq!(lp.read(&mut buf).unwrap().n, 64);
        let samples: Vec<f32> = buf
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(
            samples,
            [0.5, 0.5, 0.375, 0.375, 0.25, 0.25, 0.125, 0.125, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_no_blending_without_tail_or_when_disabled() {
        let data = loop_with_tail(&0i16.to_le_bytes(), &1000i16.to_le_bytes());
        let mut lp = InfiniteLoop::new(BytesSource::new(data), 32, SampleFormat::Int16)
            .unwrap()
            .with_blending(false);
        let mut buf = [0u8; 32];
        lp.read(&mut buf).unwrap();
        lp.read(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        let src = BytesSource::new(1000i16.to_le_bytes().repeat(16));
        let mut lp = InfiniteLoop::new(src, 32, SampleFormat::Int16).unwrap();
        lp.read(&mut buf).unwrap();
        lp.read(&mut buf).unwrap();
        assert!(buf
            .chunks_exact(2)
            .all(|b| i16::from_le_bytes([b[0], b[1]]) == 1000));
    }
}
