//! Audio output using cpal
//!
//! A cpal output stream is driven by a lock-free SPSC byte ring
//! (`ringbuf::HeapRb<u8>`): the backend loop is the producer, the cpal
//! callback is the consumer. The stream itself lives on a dedicated thread
//! because cpal streams are not `Send` on every host; play and pause requests
//! reach it over a channel.
//!
//! The callback consumes whole frames only, so a short ring never swaps
//! channels. Running dry while data is expected marks an underrun, which the
//! next `write` reports as [`DeviceError::Underrun`] until `prepare`.

use crate::backend::device::{Device, DeviceError, DeviceFactory, DeviceFormat, Notifier};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, Stream, StreamConfig};
use pcmix_common::SampleFormat;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// State shared with the real-time callback
#[derive(Default)]
struct CallbackState {
    played: AtomicU64,
    /// Data is expected; running dry now counts as an underrun
    expecting: AtomicBool,
    underrun: AtomicBool,
    underruns: AtomicU64,
    drop_requested: AtomicBool,
    /// Stream error reported by cpal's error callback
    stream_error: Mutex<Option<DeviceError>>,
    notifier: Mutex<Option<Notifier>>,
}

enum StreamCommand {
    Play(mpsc::SyncSender<std::result::Result<(), DeviceError>>),
    Pause(mpsc::SyncSender<std::result::Result<(), DeviceError>>),
    Stop,
}

/// Output device backed by a cpal stream.
pub struct CpalDevice {
    format: DeviceFormat,
    device_name: String,
    producer: HeapProd<u8>,
    shared: Arc<CallbackState>,
    commands: mpsc::Sender<StreamCommand>,
    thread: Option<JoinHandle<()>>,
    poll_interval: Duration,
    closed: bool,
}

impl CpalDevice {
    /// List available audio output devices.
    ///
    /// # Returns
    /// Vector of device names
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();

        let devices: Vec<String> = host
            .output_devices()
            .map_err(|e| Error::BackendInit(format!("Failed to enumerate devices: {}", e)))?
            .filter_map(|device| device.name().ok())
            .collect();

        debug!("Found {} output devices", devices.len());
        Ok(devices)
    }

    /// Open an output stream.
    ///
    /// # Arguments
    /// - `device_name`: Optional device name (None = default device)
    /// - `format`: Rate, channel count, sample depth and queue capacity
    ///
    /// # Fallback Behavior
    /// If the requested device is not present, the default device is used.
    pub fn open(
        device_name: Option<&str>,
        format: DeviceFormat,
    ) -> std::result::Result<Self, DeviceError> {
        let capacity = format.buffer_bytes.max(format.frame_size());
        let (producer, consumer) = HeapRb::<u8>::new(capacity).split();
        let shared = Arc::new(CallbackState::default());
        let (commands, command_rx) = mpsc::channel();
        let (init_tx, init_rx) = mpsc::sync_channel(1);

        let requested = device_name.map(str::to_string);
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("pcmix-cpal-stream".to_string())
            .spawn(move || {
                stream_thread(requested, format, consumer, thread_shared, command_rx, init_tx)
            })
            .map_err(|e| DeviceError::Backend(format!("Failed to spawn stream thread: {}", e)))?;

        let device_name = init_rx
            .recv()
            .map_err(|_| DeviceError::Backend("stream thread exited during setup".to_string()))??;

        let buffer_duration =
            Duration::from_secs_f64(capacity as f64 / format.bytes_per_second().max(1) as f64);
        let poll_interval = (buffer_duration / 8).max(Duration::from_millis(1));

        info!(
            "Audio output opened on '{}': {} Hz, {}, {} byte queue",
            device_name, format.sample_rate, format.sample_format, capacity
        );

        Ok(Self {
            format,
            device_name,
            producer,
            shared,
            commands,
            thread: Some(thread),
            poll_interval,
            closed: false,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Number of underruns observed by the callback.
    pub fn underrun_count(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    fn stream_error(&self) -> Option<DeviceError> {
        self.shared
            .stream_error
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
    }

    fn request(
        &self,
        make: fn(mpsc::SyncSender<std::result::Result<(), DeviceError>>) -> StreamCommand,
    ) -> std::result::Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.commands
            .send(make(reply_tx))
            .map_err(|_| DeviceError::Closed)?;
        reply_rx.recv().map_err(|_| DeviceError::Closed)?
    }
}

fn stream_thread(
    requested: Option<String>,
    format: DeviceFormat,
    consumer: HeapCons<u8>,
    shared: Arc<CallbackState>,
    commands: mpsc::Receiver<StreamCommand>,
    init: mpsc::SyncSender<std::result::Result<String, DeviceError>>,
) {
    let (stream, name) = match build_stream(requested.as_deref(), format, consumer, shared) {
        Ok(built) => built,
        Err(e) => {
            let _ = init.send(Err(e));
            return;
        }
    };
    if init.send(Ok(name)).is_err() {
        return;
    }

    for command in commands {
        match command {
            StreamCommand::Play(reply) => {
                let _ = reply.send(stream.play().map_err(map_play_error));
            }
            StreamCommand::Pause(reply) => {
                let _ = reply.send(stream.pause().map_err(map_pause_error));
            }
            StreamCommand::Stop => break,
        }
    }
    drop(stream);
    debug!("Audio stream thread finished");
}

fn find_device(
    host: &cpal::Host,
    requested: Option<&str>,
) -> std::result::Result<(cpal::Device, String), DeviceError> {
    if let Some(name) = requested {
        let mut devices = host
            .output_devices()
            .map_err(|e| DeviceError::Backend(format!("Failed to enumerate devices: {}", e)))?;

        if let Some(dev) = devices.find(|d| d.name().ok().as_deref() == Some(name)) {
            info!("Found requested audio device: {}", name);
            return Ok((dev, name.to_string()));
        }
        warn!("Requested device '{}' not found, falling back to default device", name);
    }

    let dev = host
        .default_output_device()
        .ok_or_else(|| DeviceError::NotFound("no default output device".to_string()))?;
    let name = dev.name().unwrap_or_else(|_| "Unknown".to_string());
    Ok((dev, name))
}

/// Pick the stream sample type: the requested one if supported, else any
/// stereo format at the requested rate that we can convert into.
fn pick_sample_format(
    device: &cpal::Device,
    format: &DeviceFormat,
) -> std::result::Result<cpal::SampleFormat, DeviceError> {
    let wanted = match format.sample_format {
        SampleFormat::Int16 => cpal::SampleFormat::I16,
        SampleFormat::Float32 => cpal::SampleFormat::F32,
    };
    let supported: Vec<cpal::SampleFormat> = device
        .supported_output_configs()
        .map_err(|e| DeviceError::Backend(format!("Failed to get device configs: {}", e)))?
        .filter(|c| {
            c.channels() == format.channels
                && c.min_sample_rate().0 <= format.sample_rate
                && c.max_sample_rate().0 >= format.sample_rate
        })
        .map(|c| c.sample_format())
        .collect();

    [wanted, cpal::SampleFormat::F32, cpal::SampleFormat::I16]
        .into_iter()
        .find(|candidate| supported.contains(candidate))
        .ok_or_else(|| {
            DeviceError::Backend(format!(
                "device supports no stereo stream at {} Hz",
                format.sample_rate
            ))
        })
}

fn build_stream(
    requested: Option<&str>,
    format: DeviceFormat,
    consumer: HeapCons<u8>,
    shared: Arc<CallbackState>,
) -> std::result::Result<(Stream, String), DeviceError> {
    let host = cpal::default_host();
    let (device, name) = find_device(&host, requested)?;
    let stream_format = pick_sample_format(&device, &format)?;
    let config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    debug!(
        "Audio config: sample_rate={}, channels={}, stream format={:?}, input format={}",
        format.sample_rate, format.channels, stream_format, format.sample_format
    );

    let stream = match stream_format {
        cpal::SampleFormat::F32 => build_typed::<f32>(&device, &config, format, consumer, shared)?,
        cpal::SampleFormat::I16 => build_typed::<i16>(&device, &config, format, consumer, shared)?,
        other => {
            return Err(DeviceError::Backend(format!(
                "Unsupported sample format: {:?}",
                other
            )))
        }
    };
    Ok((stream, name))
}

fn decode_sample(format: SampleFormat, raw: &[u8]) -> f32 {
    match format {
        SampleFormat::Int16 => i16::from_le_bytes([raw[0], raw[1]]) as f32 / 32768.0,
        SampleFormat::Float32 => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
    }
}

fn build_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    format: DeviceFormat,
    mut consumer: HeapCons<u8>,
    shared: Arc<CallbackState>,
) -> std::result::Result<Stream, DeviceError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = format.channels as usize;
    let bytes_per_sample = format.sample_format.bytes_per_sample();
    let frame_bytes = format.frame_size();
    let error_state = Arc::clone(&shared);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if shared.drop_requested.swap(false, Ordering::AcqRel) {
                    consumer.clear();
                }

                let mut raw = [0u8; 16];
                let mut consumed = 0usize;
                let mut short = false;
                for frame in data.chunks_mut(channels) {
                    if consumer.occupied_len() >= frame_bytes {
                        consumer.pop_slice(&mut raw[..frame_bytes]);
                        consumed += frame_bytes;
                        for (ch, out) in frame.iter_mut().enumerate() {
                            let at = ch * bytes_per_sample;
                            let v = decode_sample(
                                format.sample_format,
                                &raw[at..at + bytes_per_sample],
                            );
                            *out = T::from_sample(v);
                        }
                    } else {
                        frame.fill(T::EQUILIBRIUM);
                        short = true;
                    }
                }

                if consumed > 0 {
                    shared.played.fetch_add(consumed as u64, Ordering::AcqRel);
                }
                if short && shared.expecting.swap(false, Ordering::AcqRel) {
                    shared.underrun.store(true, Ordering::Release);
                    shared.underruns.fetch_add(1, Ordering::Relaxed);
                }
                if let Ok(guard) = shared.notifier.try_lock() {
                    if let Some(notify) = guard.as_ref() {
                        notify();
                    }
                }
            },
            move |err| {
                error!("Audio stream error: {} - marking device failed", err);
                let mapped = match err {
                    cpal::StreamError::DeviceNotAvailable => {
                        DeviceError::NotFound("output device disconnected".to_string())
                    }
                    cpal::StreamError::BackendSpecific { err } => {
                        DeviceError::Backend(err.to_string())
                    }
                };
                if let Ok(mut slot) = error_state.stream_error.lock() {
                    slot.get_or_insert(mapped);
                }
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                DeviceError::NotFound("output device not available".to_string())
            }
            other => DeviceError::Backend(format!("Failed to build stream: {}", other)),
        })
}

fn map_play_error(err: cpal::PlayStreamError) -> DeviceError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => {
            DeviceError::NotFound("output device not available".to_string())
        }
        cpal::PlayStreamError::BackendSpecific { err } => DeviceError::Backend(err.to_string()),
    }
}

fn map_pause_error(err: cpal::PauseStreamError) -> DeviceError {
    match err {
        cpal::PauseStreamError::DeviceNotAvailable => {
            DeviceError::NotFound("output device not available".to_string())
        }
        cpal::PauseStreamError::BackendSpecific { err } => {
            debug!("Stream pause failed ({}), treating as unsupported", err);
            DeviceError::NotSupported("pause")
        }
    }
}

impl Device for CpalDevice {
    fn format(&self) -> DeviceFormat {
        self.format
    }

    fn start(&mut self) -> std::result::Result<(), DeviceError> {
        self.request(StreamCommand::Play)
    }

    fn write(&mut self, data: &[u8]) -> std::result::Result<usize, DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        if let Some(err) = self.stream_error() {
            return Err(err);
        }
        if self.shared.underrun.load(Ordering::Acquire) {
            return Err(DeviceError::Underrun);
        }

        self.shared.expecting.store(true, Ordering::Release);
        let mut offset = 0;
        while offset < data.len() {
            offset += self.producer.push_slice(&data[offset..]);
            if offset < data.len() {
                if let Some(err) = self.stream_error() {
                    return Err(err);
                }
                thread::sleep(self.poll_interval);
            }
        }
        Ok(data.len())
    }

    fn queued_bytes(&self) -> usize {
        self.producer.occupied_len()
    }

    fn played_bytes(&self) -> u64 {
        self.shared.played.load(Ordering::Acquire)
    }

    fn set_notifier(&mut self, notifier: Notifier) {
        if let Ok(mut slot) = self.shared.notifier.lock() {
            *slot = Some(notifier);
        }
    }

    fn prepare(&mut self) -> std::result::Result<(), DeviceError> {
        self.shared.underrun.store(false, Ordering::Release);
        self.shared.expecting.store(false, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self) -> std::result::Result<(), DeviceError> {
        self.shared.expecting.store(false, Ordering::Release);
        self.request(StreamCommand::Pause)
    }

    fn resume(&mut self) -> std::result::Result<(), DeviceError> {
        self.request(StreamCommand::Play)
    }

    fn drop_queued(&mut self) -> std::result::Result<(), DeviceError> {
        self.shared.expecting.store(false, Ordering::Release);
        self.shared.drop_requested.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&mut self) -> std::result::Result<(), DeviceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("Stopping audio stream on '{}'", self.device_name);
        let _ = self.commands.send(StreamCommand::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Audio stream thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Opens [`CpalDevice`]s on the default host.
#[derive(Debug, Clone, Default)]
pub struct CpalDeviceFactory {
    device_name: Option<String>,
}

impl CpalDeviceFactory {
    /// Factory for the named device, or the default device when `None`.
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl DeviceFactory for CpalDeviceFactory {
    fn open(&self, format: DeviceFormat) -> std::result::Result<Box<dyn Device>, DeviceError> {
        Ok(Box::new(CpalDevice::open(self.device_name.as_deref(), format)?))
    }

    fn name(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }
}
