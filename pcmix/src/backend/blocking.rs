//! Blocking-write dialect
//!
//! The loop zeroes a staging buffer of half the device buffer, mixes into
//! it and writes it whole. The device write blocks while its queue is full,
//! which is all the pacing this dialect needs. An underrun is recovered by
//! preparing the device and writing again.

use crate::backend::device::{init_error, Device, DeviceFactory};
use crate::backend::driver::{
    resume_device, serve_failed, suspend_device, write_recovering, Command, Control, DriverHandle,
    IDLE_WAIT,
};
use crate::backend::mixed::MixedBackend;
use crate::backend::{device_format, Backend, BackendConfig, BackendKind};
use crate::error::{ErrorLatch, Result};
use crate::playback::mixer::Mixer;
use pcmix_common::{SampleFormat, StreamFormat};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Open the device and start the write loop.
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
    let staging = (device_format.buffer_bytes / 2 / frame * frame).max(frame);
    info!(
        "Blocking backend ready: {} byte device buffer, {} byte writes",
        device_format.buffer_bytes, staging
    );

    let writer = Writer {
        device,
        mixer: Arc::clone(&mixer),
        control: Arc::clone(&control),
        latch: Arc::clone(&latch),
        output,
        staging: vec![0u8; staging],
    };
    let driver = DriverHandle::spawn("pcmix-blocking", control, latch, move || writer.run())?;
    Ok(Arc::new(MixedBackend::new(BackendKind::Blocking, mixer, driver)))
}

struct Writer {
    device: Box<dyn Device>,
    mixer: Arc<Mixer>,
    control: Arc<Control>,
    latch: Arc<ErrorLatch>,
    output: SampleFormat,
    staging: Vec<u8>,
}

impl Writer {
    fn run(mut self) {
        let mut suspended = false;
        loop {
            let idle = suspended || !self.mixer.has_players();
            let requests = if idle {
                self.control.wait(IDLE_WAIT)
            } else {
                self.control.take_requests()
            };

            for request in requests {
                match request.command {
                    Command::Suspend => {
                        suspended = true;
                        request.reply(suspend_device(self.device.as_mut()));
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

            self.staging.fill(0);
            let mixed = self.mixer.read(&mut self.staging, self.output);
            if let Some(err) = mixed.error {
                debug!("Mix step reported a source error: {}", err);
            }
            if let Err(e) = write_recovering(self.device.as_mut(), &self.staging) {
                error!("Audio device write failed: {}", e);
                self.latch.set(e.into());
                self.shutdown();
                serve_failed(&self.control, &self.latch);
                return;
            }
        }
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.device.close() {
            warn!("Failed to close audio device: {}", e);
        }
        info!("Blocking backend stopped");
    }
}
