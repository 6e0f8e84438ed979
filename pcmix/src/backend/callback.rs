//! Callback-queue dialect
//!
//! [`BUFFER_COUNT`] float buffers cycle between the device and the loop.
//! The device's "consumed" notification returns a buffer to the unqueued
//! list; the loop takes one buffer at a time, zeroes it, mixes into it as
//! float32 and enqueues it again.
//!
//! Starting the device can fail transiently while another client holds the
//! hardware (the recording-assistant case); start is retried on
//! [`DeviceError::Busy`].

use crate::backend::device::{init_error, Device, DeviceError, DeviceFactory};
use crate::backend::driver::{
    resume_device, serve_failed, suspend_device, write_recovering, Command, Control, DriverHandle,
    IDLE_WAIT,
};
use crate::backend::mixed::MixedBackend;
use crate::backend::{device_format, Backend, BackendConfig, BackendKind};
use crate::error::{ErrorLatch, Result};
use crate::playback::mixer::Mixer;
use pcmix_common::{SampleFormat, StreamFormat};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const BUFFER_COUNT: usize = 4;

const START_ATTEMPTS: usize = 10;
const START_BACKOFF: Duration = Duration::from_millis(10);

/// Open the device and start the queue loop.
pub fn open(
    config: &BackendConfig,
    format: StreamFormat,
    factory: Arc<dyn DeviceFactory>,
) -> Result<Arc<dyn Backend>> {
    let device_format = device_format(&format, SampleFormat::Float32, config.buffer);
    let mut device = factory.open(device_format).map_err(init_error)?;

    let mixer = Mixer::new(format);
    let control = Control::new();
    let latch = Arc::new(ErrorLatch::new());
    device.set_notifier(control.notifier());
    mixer.set_notifier(control.notifier());
    start_with_retry(device.as_mut()).map_err(init_error)?;

    let frame = SampleFormat::Float32.frame_size();
    let buffer_bytes = (device_format.buffer_bytes / BUFFER_COUNT / frame * frame).max(frame);
    info!(
        "Callback backend ready: {} buffers of {} bytes",
        BUFFER_COUNT, buffer_bytes
    );

    let queue = Queue {
        device,
        mixer: Arc::clone(&mixer),
        control: Arc::clone(&control),
        latch: Arc::clone(&latch),
        buffers: vec![vec![0u8; buffer_bytes]; BUFFER_COUNT],
        unqueued: (0..BUFFER_COUNT).collect(),
        in_flight: VecDeque::with_capacity(BUFFER_COUNT),
        written: 0,
    };
    let driver = DriverHandle::spawn("pcmix-callback", control, latch, move || queue.run())?;
    Ok(Arc::new(MixedBackend::new(BackendKind::Callback, mixer, driver)))
}

fn start_with_retry(device: &mut dyn Device) -> std::result::Result<(), DeviceError> {
    let mut attempt = 1;
    loop {
        match device.start() {
            Ok(()) => return Ok(()),
            Err(DeviceError::Busy) if attempt < START_ATTEMPTS => {
                warn!("Audio device busy on start (attempt {}), retrying", attempt);
                attempt += 1;
                thread::sleep(START_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}

struct Queue {
    device: Box<dyn Device>,
    mixer: Arc<Mixer>,
    control: Arc<Control>,
    latch: Arc<ErrorLatch>,
    buffers: Vec<Vec<u8>>,
    /// Buffers ready to be filled
    unqueued: Vec<usize>,
    /// Enqueued buffers and the played-byte count at which each drains
    in_flight: VecDeque<(usize, u64)>,
    written: u64,
}

impl Queue {
    fn run(mut self) {
        let mut suspended = false;
        loop {
            self.reclaim();
            let active = !suspended && self.mixer.has_players();
            let requests = if active && !self.unqueued.is_empty() {
                self.control.take_requests()
            } else {
                self.control.wait(IDLE_WAIT)
            };

            for request in requests {
                match request.command {
                    Command::Suspend => {
                        suspended = true;
                        let result = suspend_device(self.device.as_mut());
                        self.resync();
                        request.reply(result);
                    }
                    Command::Resume => {
                        let result = resume_device(self.device.as_mut());
                        if result.is_ok() {
                            suspended = false;
                        }
                        request.reply(result);
                    }
                    Command::Close => {
                        self.shutdown();
                        request.reply(Ok(()));
                        return;
                    }
                }
            }

            if suspended || !self.mixer.has_players() {
                continue;
            }
            self.reclaim();
            let Some(index) = self.unqueued.pop() else {
                continue;
            };

            let buffer = &mut self.buffers[index];
            buffer.fill(0);
            let mixed = self.mixer.read(buffer, SampleFormat::Float32);
            if let Some(err) = mixed.error {
                debug!("Mix step reported a source error: {}", err);
            }
            if let Err(e) = write_recovering(self.device.as_mut(), buffer) {
                error!("Audio queue enqueue failed: {}", e);
                self.latch.set(e.into());
                self.shutdown();
                serve_failed(&self.control, &self.latch);
                return;
            }
            self.written += buffer.len() as u64;
            self.in_flight.push_back((index, self.written));
        }
    }

    /// Move consumed buffers back to the unqueued list.
    fn reclaim(&mut self) {
        let played = self.device.played_bytes();
        while let Some(&(index, end)) = self.in_flight.front() {
            if end > played {
                break;
            }
            self.in_flight.pop_front();
            self.unqueued.push(index);
        }
    }

    /// Return buffers whose bytes the device dropped.
    fn resync(&mut self) {
        let horizon = self.device.played_bytes() + self.device.queued_bytes() as u64;
        self.written = horizon;
        let unqueued = &mut self.unqueued;
        self.in_flight.retain(|&(index, end)| {
            if end > horizon {
                unqueued.push(index);
                false
            } else {
                true
            }
        });
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.device.close() {
            warn!("Failed to close audio device: {}", e);
        }
        info!("Callback backend stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{BytesSource, TimeStream};
    use crate::backend::memory::{MemoryDevice, MemoryDeviceFactory, MemoryDeviceOptions};
    use crate::backend::device::DeviceFormat;
    use crate::playback::PlayerId;
    use std::time::Instant;

    fn format() -> StreamFormat {
        StreamFormat::new(8000, SampleFormat::Int16)
    }

    fn config() -> BackendConfig {
        BackendConfig::new(BackendKind::Callback).with_buffer(Duration::from_millis(20))
    }

    #[test]
    fn test_start_retries_busy_device() {
        let (mut device, handle) = MemoryDevice::new(
            DeviceFormat {
                sample_rate: 8000,
                channels: 2,
                sample_format: SampleFormat::Float32,
                buffer_bytes: 64,
            },
            MemoryDeviceOptions::default(),
        );
        for _ in 0..3 {
            handle.fail_next_start(DeviceError::Busy);
        }
        start_with_retry(&mut device).unwrap();
        assert!(handle.is_started());
    }

    #[test]
    fn test_start_gives_up_after_repeated_busy() {
        let (mut device, handle) = MemoryDevice::new(
            DeviceFormat {
                sample_rate: 8000,
                channels: 2,
                sample_format: SampleFormat::Float32,
                buffer_bytes: 64,
            },
            MemoryDeviceOptions::default(),
        );
        for _ in 0..START_ATTEMPTS {
            handle.fail_next_start(DeviceError::Busy);
        }
        assert!(matches!(
            start_with_retry(&mut device),
            Err(DeviceError::Busy)
        ));
        assert!(!handle.is_started());
    }

    #[test]
    fn test_writes_float_buffers() {
        let factory = Arc::new(MemoryDeviceFactory::instant());
        let backend = open(&config(), format(), factory.clone()).unwrap();
        let handle = factory.last_handle().unwrap();
        assert_eq!(handle.format().sample_format, SampleFormat::Float32);

        let data: Vec<u8> = 16384i16.to_le_bytes().repeat(40);
        let stream = Arc::new(TimeStream::new(Box::new(BytesSource::new(data)), format()).unwrap());
        let player = backend.new_player(PlayerId(1), stream).unwrap();
        player.play().unwrap();

        // The first 20 frames, now 8 bytes each.
        assert!(handle.wait_for_played(160, Duration::from_secs(5)));
        let deadline = Instant::now() + Duration::from_secs(5);
        while player.is_playing() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let captured = handle.captured();
        for chunk in captured[..160].chunks_exact(4) {
            let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            assert_eq!(v, 0.5);
        }
        backend.close().unwrap();
        assert!(backend.err().is_none());
    }
}
