//! Ring-of-headers dialect
//!
//! The device buffer is split into [`HEADER_COUNT`] headers. A header is in
//! flight until the device's played counter passes the byte offset at which
//! it ended; the loop sleeps until a header frees up (the device notifier
//! wakes it) and then mixes into every free header and submits it.
//!
//! When the device disappears mid-stream the loop keeps serving requests
//! and reopens it every [`REOPEN_INTERVAL`], giving up after
//! [`REOPEN_ATTEMPTS`] failures with [`Error::DeviceNotFound`].

use crate::backend::device::{init_error, Device, DeviceError, DeviceFactory, DeviceFormat};
use crate::backend::driver::{
    resume_device, serve_failed, suspend_device, write_recovering, Command, Control, DriverHandle,
    IDLE_WAIT,
};
use crate::backend::mixed::MixedBackend;
use crate::backend::{device_format, Backend, BackendConfig, BackendKind};
use crate::error::{Error, ErrorLatch, Result};
use crate::playback::mixer::Mixer;
use pcmix_common::{SampleFormat, StreamFormat};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

pub const HEADER_COUNT: usize = 4;

pub const REOPEN_INTERVAL: Duration = Duration::from_millis(500);
pub const REOPEN_ATTEMPTS: usize = 10;

struct Header {
    data: Vec<u8>,
    /// Played-byte count at which this header has fully drained
    end: u64,
}

struct Reconnect {
    attempts: usize,
    next: Instant,
}

/// Open the device and start the ring loop.
pub fn open(
    config: &BackendConfig,
    format: StreamFormat,
    factory: Arc<dyn DeviceFactory>,
) -> Result<Arc<dyn Backend>> {
    let output = config.resolved_output_format();
    let device_format = device_format(&format, output, config.buffer);
    let mut device = factory.open(device_format).map_err(init_error)?;

    let mixer = Mixer::new(format);
    let control = Control::new();
    let latch = Arc::new(ErrorLatch::new());
    device.set_notifier(control.notifier());
    mixer.set_notifier(control.notifier());
    device.start().map_err(init_error)?;

    let frame = output.frame_size();
    let header_bytes = (device_format.buffer_bytes / HEADER_COUNT / frame * frame).max(frame);
    info!(
        "Ring backend ready: {} headers of {} bytes",
        HEADER_COUNT, header_bytes
    );

    let ring = Ring {
        device: Some(device),
        factory,
        device_format,
        mixer: Arc::clone(&mixer),
        control: Arc::clone(&control),
        latch: Arc::clone(&latch),
        output,
        headers: (0..HEADER_COUNT)
            .map(|_| Header {
                data: vec![0u8; header_bytes],
                end: 0,
            })
            .collect(),
        written: 0,
        suspended: false,
        lost: None,
    };
    let driver = DriverHandle::spawn("pcmix-ring", control, latch, move || ring.run())?;
    Ok(Arc::new(MixedBackend::new(BackendKind::Ring, mixer, driver)))
}

struct Ring {
    device: Option<Box<dyn Device>>,
    factory: Arc<dyn DeviceFactory>,
    device_format: DeviceFormat,
    mixer: Arc<Mixer>,
    control: Arc<Control>,
    latch: Arc<ErrorLatch>,
    output: SampleFormat,
    headers: Vec<Header>,
    /// Bytes submitted to the current device
    written: u64,
    suspended: bool,
    lost: Option<Reconnect>,
}

impl Ring {
    fn run(mut self) {
        loop {
            let requests = if let Some(lost) = &self.lost {
                self.control
                    .wait(lost.next.saturating_duration_since(Instant::now()))
            } else if self.active() && self.has_free_header() {
                self.control.take_requests()
            } else {
                self.control.wait(IDLE_WAIT)
            };

            for request in requests {
                match request.command {
                    Command::Suspend => {
                        self.suspended = true;
                        let result = match self.device.as_deref_mut() {
                            Some(device) => suspend_device(device),
                            None => Ok(()),
                        };
                        self.resync();
                        request.reply(result);
                    }
                    Command::Resume => {
                        let result = match self.device.as_deref_mut() {
                            Some(device) => resume_device(device),
                            None => Ok(()),
                        };
                        if result.is_ok() {
                            self.suspended = false;
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

            if self.lost.is_some() {
                if let Err(e) = self.try_reopen() {
                    self.fail(e);
                    return;
                }
                continue;
            }
            if !self.active() {
                continue;
            }

            match self.fill_free_headers() {
                Ok(()) => {}
                Err(DeviceError::NotFound(name)) => {
                    warn!("Audio device '{}' disappeared, will try to reopen it", name);
                    self.lose_device();
                }
                Err(e) => {
                    error!("Audio device write failed: {}", e);
                    self.fail(e.into());
                    return;
                }
            }
        }
    }

    fn active(&self) -> bool {
        !self.suspended && self.mixer.has_players()
    }

    fn has_free_header(&self) -> bool {
        match &self.device {
            Some(device) => {
                let played = device.played_bytes();
                self.headers.iter().any(|h| played >= h.end)
            }
            None => false,
        }
    }

    /// Mix into every drained header and submit it.
    fn fill_free_headers(&mut self) -> std::result::Result<(), DeviceError> {
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        let played = device.played_bytes();
        for header in self.headers.iter_mut() {
            if played < header.end {
                continue;
            }
            header.data.fill(0);
            let mixed = self.mixer.read(&mut header.data, self.output);
            if let Some(err) = mixed.error {
                debug!("Mix step reported a source error: {}", err);
            }
            write_recovering(device.as_mut(), &header.data)?;
            self.written += header.data.len() as u64;
            header.end = self.written;
        }
        Ok(())
    }

    /// Re-derive header ownership after the device dropped queued bytes.
    fn resync(&mut self) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        let horizon = device.played_bytes() + device.queued_bytes() as u64;
        self.written = horizon;
        for header in self.headers.iter_mut() {
            if header.end > horizon {
                header.end = 0;
            }
        }
    }

    fn lose_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            if let Err(e) = device.close() {
                warn!("Failed to close lost audio device: {}", e);
            }
        }
        self.lost = Some(Reconnect {
            attempts: 0,
            next: Instant::now() + REOPEN_INTERVAL,
        });
    }

    fn try_reopen(&mut self) -> Result<()> {
        let Some(lost) = self.lost.as_mut() else {
            return Ok(());
        };
        if Instant::now() < lost.next {
            return Ok(());
        }

        let opened = self.factory.open(self.device_format).and_then(|mut device| {
            device.set_notifier(self.control.notifier());
            device.start()?;
            Ok(device)
        });
        match opened {
            Ok(device) => {
                info!(
                    "Reopened audio device '{}' after {} failed attempts",
                    self.factory.name(),
                    lost.attempts
                );
                self.device = Some(device);
                self.lost = None;
                self.written = 0;
                for header in self.headers.iter_mut() {
                    header.end = 0;
                }
                Ok(())
            }
            Err(e) => {
                lost.attempts += 1;
                warn!(
                    "Reopen attempt {}/{} failed: {}",
                    lost.attempts, REOPEN_ATTEMPTS, e
                );
                if lost.attempts >= REOPEN_ATTEMPTS {
                    return Err(Error::DeviceNotFound(self.factory.name()));
                }
                lost.next = Instant::now() + REOPEN_INTERVAL;
                Ok(())
            }
        }
    }

    fn fail(&mut self, err: Error) {
        error!("Ring backend failed: {}", err);
        self.latch.set(err);
        self.shutdown();
        serve_failed(&self.control, &self.latch);
    }

    fn shutdown(&mut self) {
        if let Some(mut device) = self.device.take() {
            if let Err(e) = device.close() {
                warn!("Failed to close audio device: {}", e);
            }
        }
        info!("Ring backend stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{BytesSource, TimeStream};
    use crate::backend::memory::MemoryDeviceFactory;
    use crate::playback::PlayerId;

    fn format() -> StreamFormat {
        StreamFormat::new(8000, SampleFormat::Int16)
    }

    fn config() -> BackendConfig {
        BackendConfig::new(BackendKind::Ring).with_buffer(Duration::from_millis(20))
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    #[test]
    fn test_headers_carry_mixed_audio() {
        let factory = Arc::new(MemoryDeviceFactory::instant());
        let backend = open(&config(), format(), factory.clone()).unwrap();
        let handle = factory.last_handle().unwrap();
        assert_eq!(handle.format().sample_format, SampleFormat::Int16);

        let data: Vec<u8> = (-1234i16).to_le_bytes().repeat(100);
        let stream = Arc::new(TimeStream::new(Box::new(BytesSource::new(data.clone())), format()).unwrap());
        let player = backend.new_player(PlayerId(7), stream).unwrap();
        player.play().unwrap();

        assert!(wait_until(|| !player.is_playing()));
        assert!(handle.wait_for_played(data.len() as u64, Duration::from_secs(5)));
        assert_eq!(&handle.captured()[..data.len()], &data[..]);
        backend.close().unwrap();
    }

    #[test]
    fn test_missing_device_at_open() {
        let factory = Arc::new(MemoryDeviceFactory::instant());
        factory.fail_next_open(DeviceError::NotFound("wave out".into()));
        assert!(matches!(
            open(&config(), format(), factory),
            Err(Error::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_reopens_device_after_it_disappears() {
        let factory = Arc::new(MemoryDeviceFactory::instant());
        let backend = open(&config(), format(), factory.clone()).unwrap();
        let first = factory.last_handle().unwrap();
        first.fail_next_write(DeviceError::NotFound("wave out".into()));

        let stream = Arc::new(
            TimeStream::new(Box::new(BytesSource::new(vec![1u8; 64_000])), format()).unwrap(),
        );
        let player = backend.new_player(PlayerId(1), stream).unwrap();
        player.play().unwrap();

        assert!(wait_until(|| factory.handles().len() == 2));
        assert!(first.is_closed());
        let second = factory.last_handle().unwrap();
        assert!(wait_until(|| second.played_bytes() > 0));
        assert!(backend.err().is_none());
        backend.close().unwrap();
    }
}
