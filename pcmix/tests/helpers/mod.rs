//! Test helpers for pcmix integration tests
//!
//! Provides reusable test infrastructure:
//! - Byte and sample pattern generators
//! - Test sources: endless constant PCM, sources that fail mid-stream
//! - TestContext: a process-wide context wired to in-memory devices

#![allow(dead_code)]

use pcmix::backend::{MemoryDeviceFactory, MemoryDeviceHandle, MemoryDeviceOptions};
use pcmix::{
    BackendConfig, BackendKind, Context, ContextConfig, Error, ManualHost, ReadOutcome,
    SampleFormat, Source,
};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Standard test sample rate (44.1 kHz)
pub const TEST_SAMPLE_RATE: u32 = 44100;

/// `len` bytes where byte i is `sin(i)·256` truncated to a byte.
pub fn sin_pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as f64).sin() * 256.0) as i64 as u8)
        .collect()
}

/// `frames` stereo int16 frames of one constant sample.
pub fn const_i16(sample: i16, frames: usize) -> Vec<u8> {
    sample.to_le_bytes().repeat(frames * 2)
}

/// `frames` stereo float32 frames of one constant sample.
pub fn const_f32(sample: f32, frames: usize) -> Vec<u8> {
    sample.to_le_bytes().repeat(frames * 2)
}

pub fn i16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

pub fn f32_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Read exactly `len` bytes, looping over short reads.
///
/// Panics if the source ends early or stops producing data.
pub fn read_full<S: Source + ?Sized>(source: &mut S, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let mut filled = 0;
    let mut idle = 0;
    while filled < len {
        let outcome = source.read(&mut out[filled..]).expect("read failed");
        filled += outcome.n;
        if outcome.end && filled < len {
            panic!("source ended after {} of {} bytes", filled, len);
        }
        if outcome.n == 0 {
            idle += 1;
            assert!(idle < 1000, "source stalled at {} bytes", filled);
        } else {
            idle = 0;
        }
    }
    out
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Endless source repeating one stereo int16 sample.
pub struct ConstantSource {
    sample: [u8; 2],
    offset: usize,
}

impl ConstantSource {
    pub fn i16(sample: i16) -> Self {
        Self {
            sample: sample.to_le_bytes(),
            offset: 0,
        }
    }
}

impl Source for ConstantSource {
    fn read(&mut self, buf: &mut [u8]) -> pcmix::Result<ReadOutcome> {
        for byte in buf.iter_mut() {
            *byte = self.sample[self.offset];
            self.offset ^= 1;
        }
        Ok(ReadOutcome::data(buf.len()))
    }
}

/// Source that returns silence for `good_bytes` and then an I/O error.
pub struct FailingSource {
    good_bytes: usize,
    read: usize,
}

impl FailingSource {
    pub fn after(good_bytes: usize) -> Self {
        Self {
            good_bytes,
            read: 0,
        }
    }
}

impl Source for FailingSource {
    fn read(&mut self, buf: &mut [u8]) -> pcmix::Result<ReadOutcome> {
        let left = self.good_bytes - self.read;
        if left == 0 {
            return Err(Error::SourceIo(Arc::new(io::Error::other(
                "disk pulled out",
            ))));
        }
        let n = left.min(buf.len());
        buf[..n].fill(0);
        self.read += n;
        Ok(ReadOutcome::data(n))
    }
}

/// A live context over in-memory devices.
///
/// Any context left over from an earlier test is reset first; the context
/// is closed again on drop.
pub struct TestContext {
    pub context: Context,
    pub host: Arc<ManualHost>,
    pub factory: Arc<MemoryDeviceFactory>,
}

impl TestContext {
    /// Int16 context at 44.1 kHz on instant, recording devices.
    pub fn new(kind: BackendKind) -> Self {
        Self::build(
            ContextConfig::new(TEST_SAMPLE_RATE, SampleFormat::Int16)
                .with_backend(BackendConfig::new(kind)),
            MemoryDeviceFactory::instant(),
        )
    }

    /// Same as [`TestContext::new`] but devices drain at real time.
    pub fn paced(kind: BackendKind) -> Self {
        Self::build(
            ContextConfig::new(TEST_SAMPLE_RATE, SampleFormat::Int16)
                .with_backend(BackendConfig::new(kind)),
            MemoryDeviceFactory::new(MemoryDeviceOptions {
                paced: true,
                ..MemoryDeviceOptions::default()
            }),
        )
    }

    pub fn build(config: ContextConfig, factory: MemoryDeviceFactory) -> Self {
        Context::reset_for_testing();
        let host = ManualHost::new();
        let factory = Arc::new(factory);
        let context = Context::with_device_factory(config, host.clone(), factory.clone())
            .expect("context creation failed");
        Self {
            context,
            host,
            factory,
        }
    }

    /// The most recently opened device.
    pub fn device(&self) -> MemoryDeviceHandle {
        self.factory.last_handle().expect("no device opened yet")
    }

    /// Run host ticks until `condition` holds or `timeout` passes.
    pub fn update_until(&self, timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        wait_until(timeout, || {
            let _ = self.host.update();
            condition()
        })
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        let _ = self.context.close();
    }
}
