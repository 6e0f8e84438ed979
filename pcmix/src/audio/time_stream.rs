//! Position-tracking wrapper between a player and its source
//!
//! Keeps the byte offset of the next byte to be read and converts between
//! durations and byte offsets. The wrapper is internally locked so the mix
//! loop may read while a user thread seeks.

use crate::audio::source::{ReadOutcome, Source, SourceId};
use crate::error::{Error, Result};
use crate::sync::lock;
use pcmix_common::timing::{bytes_to_duration, duration_to_bytes};
use pcmix_common::StreamFormat;
use std::io::SeekFrom;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

pub struct TimeStream {
    format: StreamFormat,
    identity: Option<SourceId>,
    inner: Mutex<Inner>,
}

struct Inner {
    source: Box<dyn Source>,
    pos: u64,
    closed: bool,
}

impl TimeStream {
    /// Wrap `source`, taking its current position as the starting offset.
    ///
    /// Non-seekable sources start at offset 0.
    pub fn new(mut source: Box<dyn Source>, format: StreamFormat) -> Result<Self> {
        let pos = match source.seek(SeekFrom::Current(0)) {
            Ok(pos) => pos,
            Err(Error::NotSeekable) => 0,
            Err(e) => return Err(e),
        };
        let identity = source.identity();
        Ok(Self {
            format,
            identity,
            inner: Mutex::new(Inner {
                source,
                pos,
                closed: false,
            }),
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn identity(&self) -> Option<SourceId> {
        self.identity
    }

    /// Read from the source and advance the position by the bytes returned.
    pub fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Ok(ReadOutcome::end(0));
        }
        let outcome = inner.source.read(buf)?;
        inner.pos += outcome.n as u64;
        Ok(outcome)
    }

    /// Seek the source and adopt its reported position.
    pub fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(Error::PlayerClosed);
        }
        let next = inner.source.seek(pos)?;
        inner.pos = next;
        Ok(next)
    }

    /// Byte offset of the next byte to read.
    pub fn current(&self) -> u64 {
        lock(&self.inner).pos
    }

    /// Byte offset for `offset` of playback, keeping the current sub-frame phase.
    pub fn time_to_pos(&self, offset: Duration) -> u64 {
        let frame = self.format.frame_size() as u64;
        duration_to_bytes(offset, &self.format) + self.current() % frame
    }

    /// Playback time at byte offset `pos`.
    pub fn pos_to_time(&self, pos: u64) -> Duration {
        bytes_to_duration(pos, &self.format)
    }

    /// Close the source. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        debug!("Closing source at byte {}", inner.pos);
        inner.source.close()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }
}
