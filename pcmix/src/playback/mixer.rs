//! N→1 mixer for the mixed-stream backends
//!
//! The mixer keeps the set of playing players and sums their samples into
//! one output buffer per step. Each player owns a mix-local buffer filled
//! from its [`TimeStream`]; a step mixes the shortest common prefix of those
//! buffers, so bytes leave every buffer at the same pace.
//!
//! **Lock order:** mixer set → player state → stream. Player operations
//! never take the set lock while holding their own state lock.
//!
//! Int16 output sums in `i32` and saturates to the i16 range. Float32 output
//! sums in `f32` without clipping; headroom is left to the OS mixer.

use crate::audio::TimeStream;
use crate::backend::{BackendPlayer, Notifier};
use crate::error::{Error, Result};
use crate::playback::PlayerId;
use crate::sync::{lock, read, write};
use pcmix_common::{SampleFormat, StreamFormat};
use std::collections::HashSet;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use tracing::{debug, trace, warn};

/// Result of one mix step
#[derive(Debug, Default)]
pub struct MixOutput {
    /// Bytes of `out` written
    pub len: usize,
    /// First source error hit during the step; the failing player was closed
    pub error: Option<Error>,
}

#[derive(Default)]
struct MixerSet {
    playing: Vec<Arc<MuxPlayer>>,
    seeking: HashSet<PlayerId>,
    /// Accumulators reused across steps
    acc_i32: Vec<i32>,
    acc_f32: Vec<f32>,
    scratch: Vec<u8>,
}

pub struct Mixer {
    format: StreamFormat,
    set: RwLock<MixerSet>,
    notifier: Mutex<Option<Notifier>>,
}

impl Mixer {
    /// Mixer for sources in `format`.
    pub fn new(format: StreamFormat) -> Arc<Self> {
        Arc::new(Self {
            format,
            set: RwLock::new(MixerSet::default()),
            notifier: Mutex::new(None),
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Callback fired when a player joins the set.
    pub fn set_notifier(&self, notifier: Notifier) {
        *lock(&self.notifier) = Some(notifier);
    }

    /// Create a paused player reading from `stream`.
    pub fn new_player(self: &Arc<Self>, id: PlayerId, stream: Arc<TimeStream>) -> Arc<MuxPlayer> {
        let mixer = Arc::downgrade(self);
        Arc::new_cyclic(|me| MuxPlayer {
            id,
            mixer,
            me: me.clone(),
            stream,
            state: Mutex::new(MuxState {
                volume: 1.0,
                ..MuxState::default()
            }),
        })
    }

    /// True when at least one player is in the set.
    pub fn has_players(&self) -> bool {
        !read(&self.set).playing.is_empty()
    }

    pub fn player_count(&self) -> usize {
        read(&self.set).playing.len()
    }

    fn add(&self, player: Arc<MuxPlayer>) {
        {
            let mut set = write(&self.set);
            if set.playing.iter().any(|p| p.id == player.id) {
                return;
            }
            trace!("Mixer: adding player {}", player.id);
            set.playing.push(player);
        }
        if let Some(notify) = lock(&self.notifier).clone() {
            notify();
        }
    }

    fn remove(&self, id: PlayerId) {
        let mut set = write(&self.set);
        set.playing.retain(|p| p.id != id);
        set.seeking.remove(&id);
    }

    fn begin_seek(&self, id: PlayerId) {
        write(&self.set).seeking.insert(id);
    }

    fn end_seek(&self, id: PlayerId) {
        write(&self.set).seeking.remove(&id);
    }

    /// Drop every player from the set.
    pub fn clear(&self) {
        let mut set = write(&self.set);
        for player in set.playing.drain(..) {
            lock(&player.state).playing = false;
        }
        set.seeking.clear();
    }

    /// Mix one step into `out`, written as `output` samples.
    ///
    /// Bytes past the returned length are left untouched; callers zero the
    /// buffer first when they write it whole. Yields the thread when no
    /// player had data.
    pub fn read(&self, out: &mut [u8], output: SampleFormat) -> MixOutput {
        let in_frame = self.format.frame_size();
        let out_frame = output.frame_size();
        let frames = out.len() / out_frame;
        let length = frames * in_frame;

        let mut guard = write(&self.set);
        let set = &mut *guard;
        let mut error = None;
        let mut failed = Vec::new();

        // Fill every player's mix-local buffer.
        for player in &set.playing {
            if set.seeking.contains(&player.id) {
                continue;
            }
            let mut state = lock(&player.state);
            if let Err(e) = state.fill(&player.stream, length, &mut set.scratch) {
                warn!("Player {} source failed: {}", player.id, e);
                state.close_with(e.clone());
                if state.detached {
                    if let Err(e) = player.stream.close() {
                        warn!("Failed to close failed player {}: {}", player.id, e);
                    }
                }
                error.get_or_insert(e);
                failed.push(player.id);
            }
        }
        if !failed.is_empty() {
            set.playing.retain(|p| !failed.contains(&p.id));
        }

        // Lock every participant for the duration of the step.
        let mut participants = Vec::with_capacity(set.playing.len());
        for player in &set.playing {
            if set.seeking.contains(&player.id) {
                continue;
            }
            let state = lock(&player.state);
            if !state.playing || (state.eof && state.buf.is_empty()) {
                continue;
            }
            participants.push(state);
        }

        // Players that have not ended bound the step; ended ones only pad.
        let live_min = participants
            .iter()
            .filter(|s| !s.eof)
            .map(|s| s.buf.len())
            .min();
        let step = match live_min {
            Some(min) => min.min(length),
            None => participants
                .iter()
                .map(|s| s.buf.len())
                .max()
                .unwrap_or(0)
                .min(length),
        };
        let step = step - step % in_frame;
        let step_frames = step / in_frame;
        let samples = step_frames * self.format.channels as usize;

        if step == 0 {
            drop(participants);
            drop(guard);
            self.finish_players();
            thread::yield_now();
            return MixOutput { len: 0, error };
        }

        match output {
            SampleFormat::Int16 => {
                let acc = &mut set.acc_i32;
                acc.clear();
                acc.resize(samples, 0);
                for state in &participants {
                    let n = state.buf.len().min(step) / self.format.sample_format.bytes_per_sample();
                    add_i16(acc, &state.buf, n, self.format.sample_format, state.volume);
                }
                for (chunk, &v) in out.chunks_exact_mut(2).zip(acc.iter()) {
                    let clipped = v.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
                    chunk.copy_from_slice(&clipped.to_le_bytes());
                }
            }
            SampleFormat::Float32 => {
                let acc = &mut set.acc_f32;
                acc.clear();
                acc.resize(samples, 0.0);
                for state in &participants {
                    let n = state.buf.len().min(step) / self.format.sample_format.bytes_per_sample();
                    add_f32(acc, &state.buf, n, self.format.sample_format, state.volume);
                }
                for (chunk, &v) in out.chunks_exact_mut(4).zip(acc.iter()) {
                    chunk.copy_from_slice(&v.to_le_bytes());
                }
            }
        }

        for state in participants.iter_mut() {
            let n = state.buf.len().min(step);
            state.buf.drain(..n);
        }
        drop(participants);
        drop(guard);

        self.finish_players();
        trace!("Mixed {} frames", step_frames);
        MixOutput {
            len: step_frames * out_frame,
            error,
        }
    }

    /// Remove players whose source ended and whose buffer is drained, or
    /// that are no longer playing.
    fn finish_players(&self) {
        let mut set = write(&self.set);
        let seeking = std::mem::take(&mut set.seeking);
        set.playing.retain(|player| {
            if seeking.contains(&player.id) {
                return true;
            }
            let mut state = lock(&player.state);
            if !state.playing {
                return false;
            }
            if !(state.eof && state.buf.is_empty()) {
                return true;
            }
            debug!("Player {} finished", player.id);
            state.playing = false;
            if state.detached && !state.closed {
                state.closed = true;
                if let Err(e) = player.stream.close() {
                    warn!("Failed to close finished player {}: {}", player.id, e);
                    state.err.get_or_insert(e);
                }
            }
            false
        });
        set.seeking = seeking;
    }
}

fn add_i16(acc: &mut [i32], buf: &[u8], samples: usize, input: SampleFormat, volume: f64) {
    match input {
        SampleFormat::Int16 => {
            for (a, b) in acc.iter_mut().zip(buf.chunks_exact(2)).take(samples) {
                let s = i16::from_le_bytes([b[0], b[1]]);
                *a += (s as f64 * volume) as i32;
            }
        }
        SampleFormat::Float32 => {
            for (a, b) in acc.iter_mut().zip(buf.chunks_exact(4)).take(samples) {
                let s = f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64 * volume;
                *a += (s.clamp(-1.0, 1.0) * i16::MAX as f64) as i32;
            }
        }
    }
}

fn add_f32(acc: &mut [f32], buf: &[u8], samples: usize, input: SampleFormat, volume: f64) {
    let volume = volume as f32;
    match input {
        SampleFormat::Int16 => {
            for (a, b) in acc.iter_mut().zip(buf.chunks_exact(2)).take(samples) {
                let s = i16::from_le_bytes([b[0], b[1]]);
                *a += s as f32 / 32768.0 * volume;
            }
        }
        SampleFormat::Float32 => {
            for (a, b) in acc.iter_mut().zip(buf.chunks_exact(4)).take(samples) {
                *a += f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * volume;
            }
        }
    }
}

#[derive(Default)]
struct MuxState {
    playing: bool,
    buf: Vec<u8>,
    volume: f64,
    buffer_size: usize,
    eof: bool,
    err: Option<Error>,
    closed: bool,
    detached: bool,
}

impl MuxState {
    /// Read from `stream` until the buffer holds `length` bytes (or the
    /// preferred buffer size), the stream ends, or it has nothing to give.
    fn fill(&mut self, stream: &TimeStream, length: usize, scratch: &mut Vec<u8>) -> Result<()> {
        if !self.playing || self.eof {
            return Ok(());
        }
        let target = length.max(self.buffer_size);
        while self.buf.len() < target {
            let want = target - self.buf.len();
            scratch.resize(want, 0);
            let outcome = stream.read(&mut scratch[..want])?;
            self.buf.extend_from_slice(&scratch[..outcome.n]);
            if outcome.end {
                self.eof = true;
                break;
            }
            if outcome.n == 0 {
                break;
            }
        }
        Ok(())
    }

    fn close_with(&mut self, err: Error) {
        self.err.get_or_insert(err);
        self.playing = false;
        self.closed = true;
        self.buf.clear();
    }
}

/// A player mixed by [`Mixer`]
pub struct MuxPlayer {
    id: PlayerId,
    mixer: Weak<Mixer>,
    me: Weak<MuxPlayer>,
    stream: Arc<TimeStream>,
    state: Mutex<MuxState>,
}

impl MuxPlayer {
    pub fn id(&self) -> PlayerId {
        self.id
    }
}

impl BackendPlayer for MuxPlayer {
    fn play(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Ok(());
            }
            state.playing = true;
            state.eof = false;
        }
        if let (Some(mixer), Some(me)) = (self.mixer.upgrade(), self.me.upgrade()) {
            mixer.add(me);
        }
        Ok(())
    }

    fn pause(&self) {
        lock(&self.state).playing = false;
        if let Some(mixer) = self.mixer.upgrade() {
            mixer.remove(self.id);
        }
    }

    fn is_playing(&self) -> bool {
        lock(&self.state).playing
    }

    fn reset(&self) {
        self.pause();
        let mut state = lock(&self.state);
        state.buf.clear();
        state.eof = false;
    }

    fn volume(&self) -> f64 {
        lock(&self.state).volume
    }

    fn set_volume(&self, volume: f64) {
        lock(&self.state).volume = volume;
    }

    fn buffered_size(&self) -> usize {
        lock(&self.state).buf.len()
    }

    fn err(&self) -> Option<Error> {
        lock(&self.state).err.clone()
    }

    fn set_buffer_size(&self, bytes: usize) {
        lock(&self.state).buffer_size = bytes;
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let mixer = self.mixer.upgrade();
        if let Some(mixer) = &mixer {
            mixer.begin_seek(self.id);
        }
        let result = {
            let mut state = lock(&self.state);
            let result = self.stream.seek(pos);
            if result.is_ok() {
                state.buf.clear();
                state.eof = false;
            }
            result
        };
        if let Some(mixer) = &mixer {
            mixer.end_seek(self.id);
        }
        result
    }

    fn close(&self) -> Result<()> {
        self.pause();
        let mut state = lock(&self.state);
        state.closed = true;
        state.buf.clear();
        Ok(())
    }

    fn detach(&self) {
        let mut state = lock(&self.state);
        state.detached = true;
        if !state.playing {
            // Finished or failed between the owner's check and here.
            state.closed = true;
            if let Err(e) = self.stream.close() {
                warn!("Failed to close detached player {}: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{BytesSource, ReadOutcome, Source};
    use std::io;

    fn format() -> StreamFormat {
        StreamFormat::new(44100, SampleFormat::Int16)
    }

    fn constant_i16(sample: i16, frames: usize) -> Vec<u8> {
        sample.to_le_bytes().repeat(frames * 2)
    }

    fn stream(bytes: Vec<u8>) -> Arc<TimeStream> {
        Arc::new(TimeStream::new(Box::new(BytesSource::new(bytes)), format()).unwrap())
    }

    fn samples_i16(out: &[u8]) -> Vec<i16> {
        out.chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_int16_sum_saturates() {
        let mixer = Mixer::new(format());
        let a = mixer.new_player(PlayerId(1), stream(constant_i16(20000, 64)));
        let b = mixer.new_player(PlayerId(2), stream(constant_i16(20000, 64)));
        a.play().unwrap();
        b.play().unwrap();

        let mut out = vec![0u8; 64];
        let mixed = mixer.read(&mut out, SampleFormat::Int16);
        assert_eq!(mixed.len, 64);
        assert!(mixed.error.is_none());
        assert!(samples_i16(&out).iter().all(|&s| s == i16::MAX));

        let c = mixer.new_player(PlayerId(3), stream(constant_i16(-20000, 64)));
        let d = mixer.new_player(PlayerId(4), stream(constant_i16(-20000, 64)));
        a.pause();
        b.pause();
        c.play().unwrap();
        d.play().unwrap();
        mixer.read(&mut out, SampleFormat::Int16);
        assert!(samples_i16(&out).iter().all(|&s| s == i16::MIN));
    }

    #[test]
    fn test_float32_output_does_not_clip() {
        let mixer = Mixer::new(format());
        let a = mixer.new_player(PlayerId(1), stream(constant_i16(24576, 16)));
        let b = mixer.new_player(PlayerId(2), stream(constant_i16(24576, 16)));
        a.play().unwrap();
        b.play().unwrap();

        let mut out = vec![0u8; 16 * 8];
        let mixed = mixer.read(&mut out, SampleFormat::Float32);
        assert_eq!(mixed.len, 128);
        for chunk in out.chunks_exact(4) {
            let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            assert!((v - 1.5).abs() < 1e-6);
        }
    }

    #[test]
    fn test_volume_scales_samples() {
        let mixer = Mixer::new(format());
        let a = mixer.new_player(PlayerId(1), stream(constant_i16(10000, 8)));
        a.set_volume(0.5);
        a.play().unwrap();
        let mut out = vec![0u8; 32];
        mixer.read(&mut out, SampleFormat::Int16);
        assert!(samples_i16(&out).iter().all(|&s| s == 5000));
    }

    #[test]
    fn test_finished_player_leaves_set() {
        let mixer = Mixer::new(format());
        let a = mixer.new_player(PlayerId(1), stream(constant_i16(100, 4)));
        a.play().unwrap();
        let mut out = vec![0u8; 64];
        let mixed = mixer.read(&mut out, SampleFormat::Int16);
        assert_eq!(mixed.len, 16);
        assert!(!a.is_playing());
        assert!(!mixer.has_players());
    }

    #[test]
    fn test_ended_player_does_not_truncate_others() {
        let mixer = Mixer::new(format());
        let short = mixer.new_player(PlayerId(1), stream(constant_i16(100, 2)));
        let long = mixer.new_player(PlayerId(2), stream(constant_i16(100, 16)));
        short.play().unwrap();
        long.play().unwrap();

        let mut out = vec![0u8; 32];
        let mixed = mixer.read(&mut out, SampleFormat::Int16);
        assert_eq!(mixed.len, 32);
        let samples = samples_i16(&out);
        assert!(samples[..4].iter().all(|&s| s == 200));
        assert!(samples[4..].iter().all(|&s| s == 100));
        assert_eq!(mixer.player_count(), 1);
    }

    #[test]
    fn test_seek_discards_buffer() {
        let mixer = Mixer::new(format());
        let mut bytes = constant_i16(1, 8);
        bytes.extend(constant_i16(2, 8));
        let a = mixer.new_player(PlayerId(1), stream(bytes));
        a.set_buffer_size(64);
        a.play().unwrap();

        let mut out = vec![0u8; 16];
        mixer.read(&mut out, SampleFormat::Int16);
        assert_eq!(a.buffered_size(), 48);
        assert_eq!(a.seek(SeekFrom::Start(32)).unwrap(), 32);
        assert_eq!(a.buffered_size(), 0);
        mixer.read(&mut out, SampleFormat::Int16);
        assert!(samples_i16(&out).iter().all(|&s| s == 2));
    }

    struct FailingSource;

    impl Source for FailingSource {
        fn read(&mut self, _buf: &mut [u8]) -> Result<ReadOutcome> {
            Err(io::Error::new(io::ErrorKind::Other, "disk gone").into())
        }
    }

    #[test]
    fn test_source_error_closes_player() {
        let mixer = Mixer::new(format());
        let broken = Arc::new(TimeStream::new(Box::new(FailingSource), format()).unwrap());
        let a = mixer.new_player(PlayerId(1), broken);
        a.play().unwrap();
        let mut out = vec![0u8; 16];
        let mixed = mixer.read(&mut out, SampleFormat::Int16);
        assert_eq!(mixed.len, 0);
        assert!(matches!(mixed.error, Some(Error::SourceIo(_))));
        assert!(matches!(a.err(), Some(Error::SourceIo(_))));
        assert!(!mixer.has_players());
        // Closed players ignore play.
        a.play().unwrap();
        assert!(!a.is_playing());
    }

    #[test]
    fn test_detached_player_closes_stream_when_finished() {
        let mixer = Mixer::new(format());
        let s = stream(constant_i16(5, 2));
        let a = mixer.new_player(PlayerId(1), Arc::clone(&s));
        a.play().unwrap();
        a.detach();
        let mut out = vec![0u8; 32];
        mixer.read(&mut out, SampleFormat::Int16);
        assert!(s.is_closed());
    }

    /// Fails every read and records whether it was closed.
    struct BrokenSource {
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Source for BrokenSource {
        fn read(&mut self, _buf: &mut [u8]) -> Result<ReadOutcome> {
            Err(io::Error::new(io::ErrorKind::Other, "disk gone").into())
        }

        fn close(&mut self) -> Result<()> {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn broken_stream() -> (Arc<TimeStream>, Arc<std::sync::atomic::AtomicBool>) {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let source = BrokenSource {
            closed: Arc::clone(&closed),
        };
        let stream = Arc::new(TimeStream::new(Box::new(source), format()).unwrap());
        (stream, closed)
    }

    #[test]
    fn test_detached_player_closes_stream_on_source_error() {
        let mixer = Mixer::new(format());
        let (s, source_closed) = broken_stream();
        let a = mixer.new_player(PlayerId(1), Arc::clone(&s));
        a.play().unwrap();
        a.detach();

        let mut out = vec![0u8; 16];
        let mixed = mixer.read(&mut out, SampleFormat::Int16);
        assert!(mixed.error.is_some());
        assert!(s.is_closed());
        assert!(source_closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_detach_after_source_error_closes_stream() {
        let mixer = Mixer::new(format());
        let (s, source_closed) = broken_stream();
        let a = mixer.new_player(PlayerId(1), Arc::clone(&s));
        a.play().unwrap();

        let mut out = vec![0u8; 16];
        mixer.read(&mut out, SampleFormat::Int16);
        assert!(!s.is_closed());
        a.detach();
        assert!(s.is_closed());
        assert!(source_closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_pause_before_first_step() {
        let mixer = Mixer::new(format());
        let a = mixer.new_player(PlayerId(1), stream(constant_i16(3, 8)));
        a.play().unwrap();
        a.pause();
        a.play().unwrap();
        let mut out = vec![0u8; 16];
        let mixed = mixer.read(&mut out, SampleFormat::Int16);
        assert!(mixed.error.is_none());
        assert_eq!(mixed.len, 16);
    }
}
