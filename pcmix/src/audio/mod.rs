//! Byte-stream layers that sit between decoders and players.
//!
//! `Source → [InfiniteLoop] → [StereoPan] → TimeStream → Player`

pub mod infinite_loop;
pub mod pan;
pub mod source;
pub mod time_stream;

pub use infinite_loop::InfiniteLoop;
pub use pan::{left_scale, right_scale, PanHandle, StereoPan};
pub use source::{
    BytesSource, ReadOutcome, ReaderSource, SharedSource, Source, SourceId, StreamingSource,
};
pub use time_stream::TimeStream;
