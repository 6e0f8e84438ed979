//! # pcmix
//!
//! Real-time PCM mixing and playback.
//!
//! **Purpose:** Accept any number of interleaved stereo PCM byte streams,
//! mix them into one output stream (or hand each to a native per-source
//! player) and deliver the result to the platform audio device with low
//! latency.
//!
//! **Architecture:** `Source → [InfiniteLoop] → [StereoPan] → TimeStream →
//! Player → Mixer → Backend → Device`. One [`Context`] per process owns the
//! backend; players are created from it and may be played, paused, sought
//! and closed from any thread.
//!
//! Decoding and resampling are outside this crate: sources must already be
//! PCM at the context's sample rate and depth.

pub mod audio;
pub mod backend;
pub mod error;
pub mod playback;
mod sync;

pub use audio::{
    BytesSource, InfiniteLoop, PanHandle, ReadOutcome, ReaderSource, SharedSource, Source,
    SourceId, StereoPan, StreamingSource, TimeStream,
};
pub use backend::{BackendConfig, BackendKind};
pub use error::{Error, Result};
pub use pcmix_common::{SampleFormat, StreamFormat};
pub use playback::{Context, ContextConfig, Host, ManualHost, Player, PlayerId, PlayerState};
