//! Byte-stream sources
//!
//! A [`Source`] is a lazy, possibly infinite sequence of interleaved
//! little-endian PCM bytes. Reads return whatever is conveniently available:
//! a zero-length read without the end flag means "try again later", and the
//! end of the stream is reported through [`ReadOutcome::end`].
//!
//! Seeking is optional. Sources that cannot seek keep the default
//! implementation, which fails with [`Error::NotSeekable`] at runtime.

use crate::error::{Error, Result};
use crate::sync::lock;
use pcmix_common::StreamFormat;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

/// Outcome of one [`Source::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes written to the front of the buffer
    pub n: usize,
    /// The stream has no bytes after these
    pub end: bool,
}

impl ReadOutcome {
    /// `n` bytes, more may follow.
    pub const fn data(n: usize) -> Self {
        Self { n, end: false }
    }

    /// `n` final bytes.
    pub const fn end(n: usize) -> Self {
        Self { n, end: true }
    }
}

/// Identity of a source instance that can be handed to more than one owner.
///
/// Two handles with the same id read from the same cursor, so they may not
/// back two players at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(usize);

/// Readable, optionally seekable, closable PCM byte stream.
pub trait Source: Send {
    /// Read up to `buf.len()` bytes.
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome>;

    /// Move the cursor and return the new absolute position.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let _ = pos;
        Err(Error::NotSeekable)
    }

    /// Release underlying resources. Called once by the owning player.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Declared stream format, if the source knows it.
    fn format(&self) -> Option<StreamFormat> {
        None
    }

    /// Identity shared by handles onto the same underlying cursor.
    fn identity(&self) -> Option<SourceId> {
        None
    }
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        (**self).read(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn format(&self) -> Option<StreamFormat> {
        (**self).format()
    }

    fn identity(&self) -> Option<SourceId> {
        (**self).identity()
    }
}

/// Resolve a `SeekFrom` against the current position and stream length.
pub(crate) fn resolve_seek(pos: SeekFrom, current: u64, len: u64) -> Result<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => offset as i128,
        SeekFrom::Current(delta) => current as i128 + delta as i128,
        SeekFrom::End(delta) => len as i128 + delta as i128,
    };
    if target < 0 {
        return Err(Error::BadPosition(target as i64));
    }
    u64::try_from(target).map_err(|_| Error::BadPosition(i64::MAX))
}

/// Seekable source over an immutable byte buffer.
///
/// Clones share the bytes but not the cursor, so any number of players may
/// be created from the same decoded data.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Arc<[u8]>,
    pos: u64,
    format: Option<StreamFormat>,
}

impl BytesSource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
            format: None,
        }
    }

    /// Declare the format of the bytes so a mismatching context rejects them.
    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Source for BytesSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let len = self.data.len() as u64;
        if self.pos >= len {
            return Ok(ReadOutcome::end(0));
        }
        let start = self.pos as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(ReadOutcome {
            n,
            end: self.pos >= len,
        })
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.pos = resolve_seek(pos, self.pos, self.data.len() as u64)?;
        Ok(self.pos)
    }

    fn format(&self) -> Option<StreamFormat> {
        self.format
    }
}

/// Adapter for any seekable `std::io` reader, such as a file of raw PCM.
#[derive(Debug)]
pub struct ReaderSource<R> {
    inner: R,
    format: Option<StreamFormat>,
}

impl<R: Read + Seek + Send> ReaderSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            format: None,
        }
    }

    pub fn with_format(mut self, format: StreamFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek + Send> Source for ReaderSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        read_io(&mut self.inner, buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        if let SeekFrom::Current(delta) = pos {
            let current = self.inner.stream_position()?;
            if (current as i128 + delta as i128) < 0 {
                return Err(Error::BadPosition(current as i64 + delta));
            }
        }
        Ok(self.inner.seek(pos)?)
    }

    fn format(&self) -> Option<StreamFormat> {
        self.format
    }
}

/// Adapter for a forward-only reader (pipes, network streams, live decoders).
#[derive(Debug)]
pub struct StreamingSource<R> {
    inner: R,
}

impl<R: Read + Send> StreamingSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read + Send> Source for StreamingSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        read_io(&mut self.inner, buf)
    }
}

fn read_io<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome> {
    if buf.is_empty() {
        return Ok(ReadOutcome::data(0));
    }
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(ReadOutcome::end(0)),
            Ok(n) => return Ok(ReadOutcome::data(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadOutcome::data(0)),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Cloneable handle onto one source instance.
///
/// Every clone reads from the same cursor and reports the same
/// [`SourceId`], which lets a context refuse to attach it to two players.
pub struct SharedSource<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedSource<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Source> SharedSource<S> {
    pub fn new(source: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(source)),
        }
    }
}

impl<S: Source> Source for SharedSource<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        lock(&self.inner).read(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        lock(&self.inner).seek(pos)
    }

    fn close(&mut self) -> Result<()> {
        lock(&self.inner).close()
    }

    fn format(&self) -> Option<StreamFormat> {
        lock(&self.inner).format()
    }

    fn identity(&self) -> Option<SourceId> {
        Some(SourceId(Arc::as_ptr(&self.inner) as *const () as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_bytes_source_reads_and_signals_end() {
        let mut source = BytesSource::new(vec![1u8, 2, 3, 4, 5, 6]);
        let mut buf = [0u8; 4];

        assert_eq!(source.read(&mut buf).unwrap(), ReadOutcome::data(4));
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(source.read(&mut buf).unwrap(), ReadOutcome::end(2));
        assert_eq!(&buf[..2], &[5, 6]);
        assert_eq!(source.read(&mut buf).unwrap(), ReadOutcome::end(0));
    }

    #[test]
    fn test_bytes_source_seek() {
        let mut source = BytesSource::new(vec![0u8; 16]);
        assert_eq!(source.seek(SeekFrom::Start(8)).unwrap(), 8);
        assert_eq!(source.seek(SeekFrom::Current(-4)).unwrap(), 4);
        assert_eq!(source.seek(SeekFrom::End(-4)).unwrap(), 12);
        assert!(matches!(
            source.seek(SeekFrom::Current(-100)),
            Err(Error::BadPosition(_))
        ));
        assert_eq!(source.position(), 12);
    }

    #[test]
    fn test_bytes_source_clones_have_independent_cursors() {
        let data: Arc<[u8]> = Arc::from(vec![9u8; 8]);
        let mut a = BytesSource::new(Arc::clone(&data));
        let mut b = a.clone();
        let mut buf = [0u8; 8];
        a.read(&mut buf).unwrap();
        assert_eq!(a.position(), 8);
        assert_eq!(b.position(), 0);
        assert_eq!(b.read(&mut buf).unwrap().n, 8);
        assert!(a.identity().is_none());
    }

    #[test]
    fn test_reader_source() {
        let mut source = ReaderSource::new(Cursor::new(vec![1u8, 2, 3, 4]));
        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), ReadOutcome::data(4));
        assert_eq!(source.read(&mut buf).unwrap(), ReadOutcome::end(0));
        assert_eq!(source.seek(SeekFrom::Start(2)).unwrap(), 2);
        assert!(matches!(
            source.seek(SeekFrom::Current(-3)),
            Err(Error::BadPosition(-1))
        ));
    }

    #[test]
    fn test_streaming_source_is_not_seekable() {
        let mut source = StreamingSource::new(Cursor::new(vec![0u8; 4]));
        assert!(matches!(
            source.seek(SeekFrom::Start(0)),
            Err(Error::NotSeekable)
        ));
    }

    #[test]
    fn test_shared_source_identity() {
        let shared = SharedSource::new(BytesSource::new(vec![0u8; 4]));
        let other = shared.clone();
        assert!(shared.identity().is_some());
        assert_eq!(shared.identity(), other.identity());

        let unrelated = SharedSource::new(BytesSource::new(vec![0u8; 4]));
        assert_ne!(shared.identity(), unrelated.identity());
    }
}
