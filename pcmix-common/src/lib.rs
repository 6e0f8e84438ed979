//! # pcmix Common Library
//!
//! Shared code for the pcmix workspace:
//! - PCM sample format vocabulary (frame size, sample rate, alignment)
//! - Duration ↔ byte-offset conversions
//! - Configuration loading (TOML file, environment, defaults)

pub mod config;
pub mod error;
pub mod format;
pub mod timing;

pub use error::{Error, Result};
pub use format::{SampleFormat, StreamFormat, CHANNELS};
