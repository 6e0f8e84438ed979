//! Per-source native dialect
//!
//! Every player owns a float32 device of its own, opened on first play, and
//! a filler thread that keeps the device queue topped up to the player's
//! buffer size. The device's consumed notification wakes the filler; it also
//! polls so a missed wakeup only costs [`FILL_POLL`].
//!
//! Seeking bumps a generation counter under the I/O lock and drops queued
//! audio, so a chunk read before the seek is discarded rather than played.
//! At end of stream the filler waits for the queue to drain, allows
//! [`EOF_DRAIN_ALLOWANCE`] for the hardware to play its residue, and then
//! pauses the player.

use crate::audio::TimeStream;
use crate::backend::device::{init_error, Device, DeviceFactory, DeviceFormat, Notifier};
use crate::backend::driver::{resume_device, suspend_device, write_recovering};
use crate::backend::{device_format, Backend, BackendConfig, BackendKind, BackendPlayer};
use crate::error::{Error, ErrorLatch, Result};
use crate::playback::PlayerId;
use crate::sync::{lock, wait_timeout};
use pcmix_common::{SampleFormat, StreamFormat};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

pub const EOF_DRAIN_ALLOWANCE: Duration = Duration::from_millis(20);

pub const FILL_POLL: Duration = Duration::from_millis(20);

const OUT_FRAME: usize = 8;

pub struct NativeBackend {
    format: StreamFormat,
    device_format: DeviceFormat,
    factory: Arc<dyn DeviceFactory>,
    players: Mutex<HashMap<PlayerId, Weak<NativePlayer>>>,
    suspended: AtomicBool,
    closed: AtomicBool,
    latch: ErrorLatch,
}

impl NativeBackend {
    pub fn new(config: &BackendConfig, format: StreamFormat, factory: Arc<dyn DeviceFactory>) -> Self {
        Self {
            format,
            device_format: device_format(&format, SampleFormat::Float32, config.buffer),
            factory,
            players: Mutex::new(HashMap::new()),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            latch: ErrorLatch::new(),
        }
    }

    fn live_players(&self) -> Vec<Arc<NativePlayer>> {
        let mut players = lock(&self.players);
        players.retain(|_, p| p.strong_count() > 0);
        players.values().filter_map(Weak::upgrade).collect()
    }
}

impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn new_player(&self, id: PlayerId, stream: Arc<TimeStream>) -> Result<Arc<dyn BackendPlayer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::BackendRuntime("native backend is closed".to_string()));
        }
        let player = NativePlayer::new(
            id,
            stream,
            Arc::clone(&self.factory),
            self.device_format,
            self.format.frame_size(),
            self.format.sample_format,
            self.suspended.load(Ordering::Acquire),
        );
        let mut players = lock(&self.players);
        players.retain(|_, p| p.strong_count() > 0);
        players.insert(id, Arc::downgrade(&player));
        debug!("native backend: new player {}", id);
        Ok(player)
    }

    fn suspend(&self) -> Result<()> {
        self.suspended.store(true, Ordering::Release);
        for player in self.live_players() {
            player.suspend();
        }
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.suspended.store(false, Ordering::Release);
        let mut result = Ok(());
        for player in self.live_players() {
            if let Err(e) = player.resume() {
                warn!("Failed to resume player {}: {}", player.id, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    fn err(&self) -> Option<Error> {
        self.latch.get()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for player in self.live_players() {
            if let Err(e) = player.close() {
                warn!("Failed to close player {}: {}", player.id, e);
            }
        }
        lock(&self.players).clear();
        Ok(())
    }
}

struct NativeState {
    device: Option<Box<dyn Device>>,
    device_started: bool,
    device_running: bool,
    filler: Option<JoinHandle<()>>,
    playing: bool,
    suspended: bool,
    volume: f64,
    /// Fill target in device bytes
    buffer_bytes: usize,
    eof: bool,
    err: Option<Error>,
    closed: bool,
    detached: bool,
}

impl NativeState {
    /// Fill target, capped at what the open device can hold.
    fn fill_target(&self) -> usize {
        let capacity = self
            .device
            .as_ref()
            .map_or(self.buffer_bytes, |d| d.format().buffer_bytes);
        self.buffer_bytes.min(capacity)
    }
}

/// A player with its own device.
pub struct NativePlayer {
    id: PlayerId,
    stream: Arc<TimeStream>,
    factory: Arc<dyn DeviceFactory>,
    device_format: DeviceFormat,
    in_frame: usize,
    in_format: SampleFormat,
    state: Mutex<NativeState>,
    cond: Condvar,
    io: Mutex<()>,
    generation: AtomicU64,
    me: Weak<NativePlayer>,
}

impl NativePlayer {
    fn new(
        id: PlayerId,
        stream: Arc<TimeStream>,
        factory: Arc<dyn DeviceFactory>,
        device_format: DeviceFormat,
        in_frame: usize,
        in_format: SampleFormat,
        suspended: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            stream,
            factory,
            device_format,
            in_frame,
            in_format,
            state: Mutex::new(NativeState {
                device: None,
                device_started: false,
                device_running: false,
                filler: None,
                playing: false,
                suspended,
                volume: 1.0,
                buffer_bytes: device_format.buffer_bytes,
                eof: false,
                err: None,
                closed: false,
                detached: false,
            }),
            cond: Condvar::new(),
            io: Mutex::new(()),
            generation: AtomicU64::new(0),
            me: me.clone(),
        })
    }

    fn notifier(&self) -> Notifier {
        let me = self.me.clone();
        Arc::new(move || {
            if let Some(player) = me.upgrade() {
                player.cond.notify_all();
            }
        })
    }

    fn run_device(&self, state: &mut NativeState) -> Result<()> {
        if state.device_running {
            return Ok(());
        }
        let Some(device) = state.device.as_deref_mut() else {
            return Ok(());
        };
        if state.device_started {
            resume_device(device)?;
        } else {
            device.start()?;
            state.device_started = true;
        }
        state.device_running = true;
        Ok(())
    }

    fn stop_device(&self, state: &mut NativeState) {
        if !state.device_running {
            return;
        }
        if let Some(device) = state.device.as_deref_mut() {
            if let Err(e) = suspend_device(device) {
                warn!("Failed to pause device of player {}: {}", self.id, e);
            }
        }
        state.device_running = false;
    }

    fn suspend(&self) {
        let mut state = lock(&self.state);
        state.suspended = true;
        self.stop_device(&mut state);
    }

    fn resume(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.suspended = false;
        if state.playing && !state.closed {
            self.run_device(&mut state)?;
        }
        self.cond.notify_all();
        Ok(())
    }

    fn fill_loop(self: Arc<Self>) {
        let mut chunk = Vec::new();
        let mut out = Vec::new();
        // Trailing partial frame of the last read, valid for `carry_generation`
        let mut carry: Vec<u8> = Vec::with_capacity(self.in_frame);
        let mut carry_generation = 0;
        loop {
            let (room, volume) = {
                let mut state = lock(&self.state);
                loop {
                    if state.closed {
                        return;
                    }
                    if state.playing && !state.suspended {
                        let queued = state.device.as_ref().map_or(0, |d| d.queued_bytes());
                        if state.eof {
                            if queued == 0 {
                                break (0, 0.0);
                            }
                        } else {
                            let target = state.fill_target();
                            if queued < target {
                                break (target - queued, state.volume);
                            }
                        }
                    }
                    state = wait_timeout(&self.cond, state, FILL_POLL);
                }
            };

            if room == 0 {
                self.finish_after_drain();
                continue;
            }

            let frames = (room / OUT_FRAME).max(1);
            chunk.resize(frames * self.in_frame, 0);
            let (generation, carried, read) = {
                let _io = lock(&self.io);
                let generation = self.generation.load(Ordering::Acquire);
                if generation != carry_generation {
                    carry.clear();
                    carry_generation = generation;
                }
                let carried = carry.len();
                chunk[..carried].copy_from_slice(&carry);
                (generation, carried, self.stream.read(&mut chunk[carried..]))
            };
            let outcome = match read {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Player {} source failed: {}", self.id, e);
                    self.fail(e);
                    return;
                }
            };
            let total = carried + outcome.n;
            let n = total - total % self.in_frame;
            carry.clear();
            carry.extend_from_slice(&chunk[n..total]);
            to_f32(&chunk[..n], self.in_format, volume, &mut out);

            let mut state = lock(&self.state);
            if state.closed || self.generation.load(Ordering::Acquire) != generation {
                continue;
            }
            if !out.is_empty() {
                if let Some(device) = state.device.as_deref_mut() {
                    if let Err(e) = write_recovering(device, &out) {
                        drop(state);
                        error!("Player {} device write failed: {}", self.id, e);
                        self.fail(e.into());
                        return;
                    }
                }
            }
            if outcome.end {
                state.eof = true;
            } else if outcome.n == 0 {
                // Source has nothing yet; back off instead of spinning.
                let _state = wait_timeout(&self.cond, state, FILL_POLL);
            }
        }
    }

    fn finish_after_drain(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        thread::sleep(EOF_DRAIN_ALLOWANCE);

        let mut state = lock(&self.state);
        if self.generation.load(Ordering::Acquire) != generation
            || !state.eof
            || !state.playing
            || state.closed
        {
            return;
        }
        debug!("Native player {} finished", self.id);
        state.playing = false;
        self.stop_device(&mut state);
        if state.detached {
            state.closed = true;
            if let Some(mut device) = state.device.take() {
                if let Err(e) = device.close() {
                    warn!("Failed to close device of player {}: {}", self.id, e);
                }
            }
            drop(state);
            if let Err(e) = self.stream.close() {
                warn!("Failed to close finished player {}: {}", self.id, e);
            }
        }
    }

    fn fail(&self, err: Error) {
        let mut state = lock(&self.state);
        state.err.get_or_insert(err);
        state.closed = true;
        state.playing = false;
        state.device_running = false;
        if let Some(mut device) = state.device.take() {
            if let Err(e) = device.close() {
                warn!("Failed to close device of player {}: {}", self.id, e);
            }
        }
        // Nobody else holds a detached player, so its stream is closed here.
        let detached = state.detached;
        drop(state);
        if detached {
            if let Err(e) = self.stream.close() {
                warn!("Failed to close failed player {}: {}", self.id, e);
            }
        }
    }
}

fn to_f32(input: &[u8], format: SampleFormat, volume: f64, out: &mut Vec<u8>) {
    let volume = volume as f32;
    out.clear();
    match format {
        SampleFormat::Int16 => {
            for b in input.chunks_exact(2) {
                let v = i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0 * volume;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        SampleFormat::Float32 => {
            for b in input.chunks_exact(4) {
                let v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]) * volume;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
    }
}

impl BackendPlayer for NativePlayer {
    fn play(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.closed || state.playing {
            return Ok(());
        }
        if state.device.is_none() {
            let mut format = self.device_format;
            format.buffer_bytes = state.buffer_bytes;
            let mut device = self.factory.open(format).map_err(init_error)?;
            device.set_notifier(self.notifier());
            state.device = Some(device);
        }
        state.playing = true;
        state.eof = false;
        if !state.suspended {
            self.run_device(&mut state)?;
        }
        if state.filler.is_none() {
            if let Some(me) = self.me.upgrade() {
                let filler = thread::Builder::new()
                    .name(format!("pcmix-native-{}", self.id))
                    .spawn(move || me.fill_loop())
                    .map_err(|e| Error::BackendInit(format!("Failed to spawn filler: {}", e)))?;
                state.filler = Some(filler);
            }
        }
        self.cond.notify_all();
        Ok(())
    }

    fn pause(&self) {
        let mut state = lock(&self.state);
        if !state.playing {
            return;
        }
        state.playing = false;
        self.stop_device(&mut state);
        self.cond.notify_all();
    }

    fn is_playing(&self) -> bool {
        lock(&self.state).playing
    }

    fn reset(&self) {
        let _io = lock(&self.io);
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut state = lock(&self.state);
        state.playing = false;
        self.stop_device(&mut state);
        if let Some(device) = state.device.as_deref_mut() {
            if let Err(e) = device.drop_queued() {
                warn!("Failed to drop queued audio on reset: {}", e);
            }
        }
        state.eof = false;
    }

    fn volume(&self) -> f64 {
        lock(&self.state).volume
    }

    fn set_volume(&self, volume: f64) {
        lock(&self.state).volume = volume;
    }

    fn buffered_size(&self) -> usize {
        let state = lock(&self.state);
        let queued = state.device.as_ref().map_or(0, |d| d.queued_bytes());
        queued / OUT_FRAME * self.in_frame
    }

    fn err(&self) -> Option<Error> {
        lock(&self.state).err.clone()
    }

    fn set_buffer_size(&self, bytes: usize) {
        let frames = (bytes / self.in_frame).max(1);
        lock(&self.state).buffer_bytes = frames * OUT_FRAME;
        self.cond.notify_all();
    }

    fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let _io = lock(&self.io);
        self.generation.fetch_add(1, Ordering::AcqRel);
        {
            let mut state = lock(&self.state);
            if let Some(device) = state.device.as_deref_mut() {
                if let Err(e) = device.drop_queued() {
                    warn!("Failed to drop queued audio on seek: {}", e);
                }
            }
            state.eof = false;
        }
        self.cond.notify_all();
        self.stream.seek(pos)
    }

    fn close(&self) -> Result<()> {
        let filler = {
            let mut state = lock(&self.state);
            if state.closed && state.device.is_none() && state.filler.is_none() {
                return Ok(());
            }
            state.closed = true;
            state.playing = false;
            state.device_running = false;
            if let Some(mut device) = state.device.take() {
                if let Err(e) = device.close() {
                    warn!("Failed to close device of player {}: {}", self.id, e);
                }
            }
            state.filler.take()
        };
        self.cond.notify_all();
        if let Some(filler) = filler {
            if filler.thread().id() != thread::current().id() && filler.join().is_err() {
                error!("Filler thread of player {} panicked", self.id);
            }
        }
        Ok(())
    }

    fn detach(&self) {
        let finished = {
            let mut state = lock(&self.state);
            state.detached = true;
            !state.playing
        };
        if finished {
            if let Err(e) = self.close() {
                warn!("Failed to close detached player {}: {}", self.id, e);
            }
            if let Err(e) = self.stream.close() {
                warn!("Failed to close source of detached player {}: {}", self.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{BytesSource, ReadOutcome, Source};
    use crate::backend::memory::{MemoryDeviceFactory, MemoryDeviceOptions};
    use std::io;
    use std::time::Instant;

    /// Hands out at most `limit` bytes per read, splitting frames.
    struct TrickleSource {
        inner: BytesSource,
        limit: usize,
    }

    impl Source for TrickleSource {
        fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
            let n = buf.len().min(self.limit);
            self.inner.read(&mut buf[..n])
        }
    }

    /// Fails every read and records whether it was closed.
    struct BrokenSource {
        closed: Arc<AtomicBool>,
    }

    impl Source for BrokenSource {
        fn read(&mut self, _buf: &mut [u8]) -> Result<ReadOutcome> {
            Err(io::Error::new(io::ErrorKind::Other, "disk gone").into())
        }

        fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn format() -> StreamFormat {
        StreamFormat::new(8000, SampleFormat::Int16)
    }

    fn backend(factory: &Arc<MemoryDeviceFactory>) -> NativeBackend {
        let config = BackendConfig::new(BackendKind::Native).with_buffer(Duration::from_millis(20));
        NativeBackend::new(&config, format(), factory.clone())
    }

    fn stream(bytes: Vec<u8>) -> Arc<TimeStream> {
        Arc::new(TimeStream::new(Box::new(BytesSource::new(bytes)), format()).unwrap())
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn test_device_opened_on_first_play() {
        let factory = Arc::new(MemoryDeviceFactory::instant());
        let backend = backend(&factory);
        let player = backend.new_player(PlayerId(1), stream(vec![0u8; 64])).unwrap();
        assert!(factory.handles().is_empty());
        player.play().unwrap();
        assert_eq!(factory.handles().len(), 1);
        assert_eq!(
            factory.last_handle().unwrap().format().sample_format,
            SampleFormat::Float32
        );
        player.close().unwrap();
        player.close().unwrap();
    }

    #[test]
    fn test_plays_to_end_then_pauses() {
        let factory = Arc::new(MemoryDeviceFactory::instant());
        let backend = backend(&factory);
        let data: Vec<u8> = (-16384i16).to_le_bytes().repeat(200);
        let player = backend.new_player(PlayerId(1), stream(data)).unwrap();
        player.play().unwrap();

        assert!(wait_until(|| !player.is_playing()));
        let handle = factory.last_handle().unwrap();
        let captured = handle.captured();
        assert_eq!(captured.len(), 200 * 4);
        assert!(captured
            .chunks_exact(4)
            .all(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) == -0.5));
        assert!(player.err().is_none());
        backend.close().unwrap();
        assert!(handle.is_closed());
    }

    #[test]
    fn test_detached_player_closes_stream() {
        let factory = Arc::new(MemoryDeviceFactory::instant());
        let backend = backend(&factory);
        let s = stream(vec![0u8; 256]);
        let player = backend.new_player(PlayerId(2), Arc::clone(&s)).unwrap();
        player.play().unwrap();
        player.detach();
        drop(player);
        assert!(wait_until(|| s.is_closed()));
    }

    #[test]
    fn test_short_reads_keep_frames_aligned() {
        let factory = Arc::new(MemoryDeviceFactory::instant());
        let backend = backend(&factory);
        let mut data = Vec::new();
        for _ in 0..64 {
            data.extend_from_slice(&1000i16.to_le_bytes());
            data.extend_from_slice(&(-1000i16).to_le_bytes());
        }
        let source = TrickleSource {
            inner: BytesSource::new(data),
            limit: 6,
        };
        let s = Arc::new(TimeStream::new(Box::new(source), format()).unwrap());
        let player = backend.new_player(PlayerId(4), s).unwrap();
        player.play().unwrap();

        assert!(wait_until(|| !player.is_playing()));
        let captured = factory.last_handle().unwrap().captured();
        let samples: Vec<f32> = captured
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let left = 1000.0 / 32768.0;
        assert_eq!(samples.len(), 64 * 2);
        for frame in samples.chunks_exact(2) {
            assert_eq!(frame, [left, -left]);
        }
        backend.close().unwrap();
    }

    #[test]
    fn test_detached_player_closes_stream_on_source_error() {
        let factory = Arc::new(MemoryDeviceFactory::instant());
        let backend = backend(&factory);
        let closed = Arc::new(AtomicBool::new(false));
        let source = BrokenSource {
            closed: Arc::clone(&closed),
        };
        let s = Arc::new(TimeStream::new(Box::new(source), format()).unwrap());
        let player = backend.new_player(PlayerId(5), Arc::clone(&s)).unwrap();
        player.play().unwrap();
        player.detach();
        drop(player);

        assert!(wait_until(|| s.is_closed()));
        assert!(closed.load(Ordering::SeqCst));
        backend.close().unwrap();
    }

    #[test]
    fn test_suspend_pauses_devices() {
        let factory = Arc::new(MemoryDeviceFactory::new(MemoryDeviceOptions {
            paced: true,
            ..MemoryDeviceOptions::default()
        }));
        let backend = backend(&factory);
        let player = backend
            .new_player(PlayerId(3), stream(vec![0u8; 1 << 20]))
            .unwrap();
        player.play().unwrap();
        let handle = factory.last_handle().unwrap();

        backend.suspend().unwrap();
        assert!(handle.is_paused());
        backend.resume().unwrap();
        assert!(!handle.is_paused());
        backend.close().unwrap();
        assert!(!player.is_playing());
    }
}
