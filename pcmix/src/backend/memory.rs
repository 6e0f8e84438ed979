//! In-process output device
//!
//! `MemoryDevice` behaves like a real PCM queue without touching hardware.
//! It either consumes written bytes immediately or drains them at the
//! device's real-time byte rate, optionally recording everything it plays.
//! Hosts without audio hardware use the paced, non-recording flavor as a
//! null sink; tests use the instant, recording flavor together with the
//! fault-injection hooks on [`MemoryDeviceHandle`].

use crate::backend::device::{Device, DeviceError, DeviceFactory, DeviceFormat, Notifier};
use crate::sync::{lock, wait_timeout};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Clock granularity of a paced device
const PACE_TICK: Duration = Duration::from_millis(5);

/// Wait slice while a writer is blocked on a full queue
const WRITE_WAIT: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct MemoryDeviceOptions {
    /// Drain at the device's byte rate instead of instantly
    pub paced: bool,
    /// Maximum number of played bytes kept for inspection
    pub capture_limit: usize,
    /// Whether `pause` is available (otherwise it reports `NotSupported`)
    pub supports_pause: bool,
}

impl Default for MemoryDeviceOptions {
    fn default() -> Self {
        Self {
            paced: false,
            capture_limit: 16 * 1024 * 1024,
            supports_pause: true,
        }
    }
}

impl MemoryDeviceOptions {
    /// Real-time paced sink that records nothing.
    pub fn null() -> Self {
        Self {
            paced: true,
            capture_limit: 0,
            supports_pause: true,
        }
    }
}

struct Shared {
    format: DeviceFormat,
    options: MemoryDeviceOptions,
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    queue: VecDeque<u8>,
    played: u64,
    capture: Vec<u8>,
    started: bool,
    paused: bool,
    closed: bool,
    underrun: bool,
    write_faults: VecDeque<DeviceError>,
    start_faults: VecDeque<DeviceError>,
    resume_faults: VecDeque<DeviceError>,
    prepares: usize,
    pauses: usize,
    drops: usize,
    notifier: Option<Notifier>,
}

impl State {
    fn running(&self) -> bool {
        self.started && !self.paused && !self.closed
    }

    /// Move up to `budget` queued bytes to the played side.
    fn consume(&mut self, budget: usize, capture_limit: usize) -> usize {
        let n = budget.min(self.queue.len());
        if n == 0 {
            return 0;
        }
        let room = capture_limit.saturating_sub(self.capture.len()).min(n);
        self.capture.extend(self.queue.iter().take(room));
        self.queue.drain(..n);
        self.played += n as u64;
        n
    }
}

impl Shared {
    /// Instant devices play everything queued as soon as they are running.
    fn drain_instant(&self, state: &mut State) -> Option<Notifier> {
        if self.options.paced || !state.running() {
            return None;
        }
        let len = state.queue.len();
        if state.consume(len, self.options.capture_limit) > 0 {
            self.cond.notify_all();
            state.notifier.clone()
        } else {
            None
        }
    }
}

/// Device that plays into memory.
pub struct MemoryDevice {
    shared: Arc<Shared>,
}

impl MemoryDevice {
    pub fn new(format: DeviceFormat, options: MemoryDeviceOptions) -> (Self, MemoryDeviceHandle) {
        let paced = options.paced;
        let shared = Arc::new(Shared {
            format,
            options,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        });
        if paced {
            spawn_clock(Arc::downgrade(&shared));
        }
        let handle = MemoryDeviceHandle {
            shared: Arc::clone(&shared),
        };
        (Self { shared }, handle)
    }
}

fn spawn_clock(shared: Weak<Shared>) {
    let spawned = thread::Builder::new()
        .name("pcmix-null-clock".to_string())
        .spawn(move || {
            let mut last = Instant::now();
            let mut owed = 0.0f64;
            loop {
                thread::sleep(PACE_TICK);
                let Some(shared) = shared.upgrade() else { return };
                let notifier = {
                    let mut state = lock(&shared.state);
                    if state.closed {
                        return;
                    }
                    let now = Instant::now();
                    let elapsed = now.duration_since(last);
                    last = now;
                    if !state.running() {
                        owed = 0.0;
                        continue;
                    }
                    owed += elapsed.as_secs_f64() * shared.format.bytes_per_second() as f64;
                    let frame = shared.format.frame_size();
                    let budget = owed as usize / frame * frame;
                    owed -= budget as f64;
                    if state.consume(budget, shared.options.capture_limit) == 0 {
                        continue;
                    }
                    shared.cond.notify_all();
                    state.notifier.clone()
                };
                if let Some(notify) = notifier {
                    notify();
                }
            }
        });
    if let Err(e) = spawned {
        tracing::error!("Failed to spawn memory device clock: {}", e);
    }
}

impl Device for MemoryDevice {
    fn format(&self) -> DeviceFormat {
        self.shared.format
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        let notifier = {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return Err(DeviceError::Closed);
            }
            if let Some(fault) = state.start_faults.pop_front() {
                return Err(fault);
            }
            state.started = true;
            self.shared.drain_instant(&mut state)
        };
        if let Some(notify) = notifier {
            notify();
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DeviceError> {
        let capacity = self.shared.format.buffer_bytes.max(1);
        let mut offset = 0;
        let mut state = lock(&self.shared.state);
        if let Some(fault) = state.write_faults.pop_front() {
            return Err(fault);
        }
        if state.underrun {
            return Err(DeviceError::Underrun);
        }
        while offset < data.len() {
            if state.closed {
                return Err(DeviceError::Closed);
            }
            let space = capacity.saturating_sub(state.queue.len());
            if space == 0 {
                state = wait_timeout(&self.shared.cond, state, WRITE_WAIT);
                continue;
            }
            let take = space.min(data.len() - offset);
            state.queue.extend(&data[offset..offset + take]);
            offset += take;
            if let Some(notify) = self.shared.drain_instant(&mut state) {
                drop(state);
                notify();
                state = lock(&self.shared.state);
            }
        }
        trace!("Memory device queued {} bytes", data.len());
        Ok(data.len())
    }

    fn queued_bytes(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    fn played_bytes(&self) -> u64 {
        lock(&self.shared.state).played
    }

    fn set_notifier(&mut self, notifier: Notifier) {
        lock(&self.shared.state).notifier = Some(notifier);
    }

    fn prepare(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.shared.state);
        state.prepares += 1;
        state.underrun = false;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), DeviceError> {
        if !self.shared.options.supports_pause {
            return Err(DeviceError::NotSupported("pause"));
        }
        let mut state = lock(&self.shared.state);
        state.paused = true;
        state.pauses += 1;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        let notifier = {
            let mut state = lock(&self.shared.state);
            if let Some(fault) = state.resume_faults.pop_front() {
                return Err(fault);
            }
            state.paused = false;
            self.shared.drain_instant(&mut state)
        };
        if let Some(notify) = notifier {
            notify();
        }
        Ok(())
    }

    fn drop_queued(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.shared.state);
        state.queue.clear();
        state.drops += 1;
        self.shared.cond.notify_all();
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.shared.state);
        if !state.closed {
            debug!("Closing memory device after {} bytes", state.played);
            state.closed = true;
            self.shared.cond.notify_all();
        }
        Ok(())
    }
}

impl Drop for MemoryDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Inspection and fault-injection handle onto a [`MemoryDevice`].
#[derive(Clone)]
pub struct MemoryDeviceHandle {
    shared: Arc<Shared>,
}

impl MemoryDeviceHandle {
    pub fn format(&self) -> DeviceFormat {
        self.shared.format
    }

    /// Every played byte, up to the capture limit.
    pub fn captured(&self) -> Vec<u8> {
        lock(&self.shared.state).capture.clone()
    }

    pub fn clear_capture(&self) {
        lock(&self.shared.state).capture.clear();
    }

    pub fn played_bytes(&self) -> u64 {
        lock(&self.shared.state).played
    }

    pub fn queued_bytes(&self) -> usize {
        lock(&self.shared.state).queue.len()
    }

    pub fn is_started(&self) -> bool {
        lock(&self.shared.state).started
    }

    pub fn is_paused(&self) -> bool {
        lock(&self.shared.state).paused
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    pub fn prepare_count(&self) -> usize {
        lock(&self.shared.state).prepares
    }

    pub fn pause_count(&self) -> usize {
        lock(&self.shared.state).pauses
    }

    pub fn drop_count(&self) -> usize {
        lock(&self.shared.state).drops
    }

    /// Make writes fail with `Underrun` until the next `prepare`.
    pub fn inject_underrun(&self) {
        lock(&self.shared.state).underrun = true;
    }

    pub fn fail_next_write(&self, err: DeviceError) {
        lock(&self.shared.state).write_faults.push_back(err);
    }

    pub fn fail_next_start(&self, err: DeviceError) {
        lock(&self.shared.state).start_faults.push_back(err);
    }

    pub fn fail_next_resume(&self, err: DeviceError) {
        lock(&self.shared.state).resume_faults.push_back(err);
    }

    /// Block until at least `bytes` have been played or `timeout` passes.
    pub fn wait_for_played(&self, bytes: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared.state);
        while state.played < bytes {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = wait_timeout(&self.shared.cond, state, deadline - now);
        }
        true
    }
}

/// Factory producing [`MemoryDevice`]s and keeping their handles.
pub struct MemoryDeviceFactory {
    options: MemoryDeviceOptions,
    handles: Mutex<Vec<MemoryDeviceHandle>>,
    open_faults: Mutex<VecDeque<DeviceError>>,
}

impl MemoryDeviceFactory {
    pub fn new(options: MemoryDeviceOptions) -> Self {
        Self {
            options,
            handles: Mutex::new(Vec::new()),
            open_faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Instant, recording devices.
    pub fn instant() -> Self {
        Self::new(MemoryDeviceOptions::default())
    }

    /// Paced, non-recording devices.
    pub fn null() -> Self {
        Self::new(MemoryDeviceOptions::null())
    }

    /// Handles of every device opened so far, in order.
    pub fn handles(&self) -> Vec<MemoryDeviceHandle> {
        lock(&self.handles).clone()
    }

    pub fn last_handle(&self) -> Option<MemoryDeviceHandle> {
        lock(&self.handles).last().cloned()
    }

    pub fn fail_next_open(&self, err: DeviceError) {
        lock(&self.open_faults).push_back(err);
    }
}

impl DeviceFactory for MemoryDeviceFactory {
    fn open(&self, format: DeviceFormat) -> Result<Box<dyn Device>, DeviceError> {
        if let Some(fault) = lock(&self.open_faults).pop_front() {
            return Err(fault);
        }
        let (device, handle) = MemoryDevice::new(format, self.options.clone());
        lock(&self.handles).push(handle);
        debug!(
            "Opened memory device: {} Hz, {}, {} byte queue",
            format.sample_rate, format.sample_format, format.buffer_bytes
        );
        Ok(Box::new(device))
    }

    fn name(&self) -> String {
        if self.options.paced {
            "null".to_string()
        } else {
            "memory".to_string()
        }
    }
}
