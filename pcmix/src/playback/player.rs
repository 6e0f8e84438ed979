//! User-facing player handle
//!
//! A [`Player`] binds one source to the context's backend. The backend side
//! is created lazily on the first operation that needs it, because the
//! audio host may not be ready when players are constructed.
//!
//! # Lifecycle
//!
//! `Paused ⇄ Playing → Closed`. Close is idempotent and absorbing. Dropping
//! a paused player closes it; dropping a playing player detaches it, so it
//! plays to the end of its source and is then closed by the backend.

use crate::audio::{SourceId, TimeStream};
use crate::backend::BackendPlayer;
use crate::error::{Error, Result};
use crate::playback::context::ContextInner;
use crate::sync::lock;
use pcmix_common::timing::{duration_to_bytes, frames_to_duration};
use std::fmt;
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identifier of a player within its context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlayerId(pub(crate) u64);

impl PlayerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Ids for players driven through a standalone [`Mixer`](crate::playback::Mixer).
impl From<u64> for PlayerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Player lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Paused,
    Playing,
    Closed,
}

/// Stopwatch smoothing `position()` between buffer refills.
struct PositionClock {
    pos: Option<u64>,
    since: Instant,
}

struct PlayerFields {
    backend: Option<Arc<dyn BackendPlayer>>,
    volume: f64,
    /// Requested buffer size in stream bytes
    buffer_size: Option<usize>,
    closed: bool,
    err: Option<Error>,
    clock: PositionClock,
}

/// Handle controlling the playback of one source.
pub struct Player {
    id: PlayerId,
    context: Arc<ContextInner>,
    stream: Arc<TimeStream>,
    source_id: Option<SourceId>,
    fields: Mutex<PlayerFields>,
}

impl Player {
    pub(crate) fn new(
        id: PlayerId,
        context: Arc<ContextInner>,
        stream: Arc<TimeStream>,
        source_id: Option<SourceId>,
    ) -> Self {
        Self {
            id,
            context,
            stream,
            source_id,
            fields: Mutex::new(PlayerFields {
                backend: None,
                volume: 1.0,
                buffer_size: None,
                closed: false,
                err: None,
                clock: PositionClock {
                    pos: None,
                    since: Instant::now(),
                },
            }),
        }
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    fn ensure_backend(&self, fields: &mut PlayerFields) -> Result<Arc<dyn BackendPlayer>> {
        if let Some(backend) = &fields.backend {
            return Ok(Arc::clone(backend));
        }
        let backend = self.context.ensure_backend()?;
        let player = backend.new_player(self.id, Arc::clone(&self.stream))?;
        player.set_volume(fields.volume);
        if let Some(size) = fields.buffer_size {
            player.set_buffer_size(size);
        }
        fields.backend = Some(Arc::clone(&player));
        Ok(player)
    }

    /// Start or continue playback.
    ///
    /// # Errors
    /// The context's latched error, or a backend initialization failure
    /// (which is not latched, so a later call may succeed).
    pub fn play(&self) -> Result<()> {
        let mut fields = lock(&self.fields);
        if fields.closed {
            warn!("Player {}: play after close ignored", self.id);
            return Ok(());
        }
        if let Some(err) = self.context.err() {
            fields.err.get_or_insert(err.clone());
            return Err(err);
        }
        let backend = self.ensure_backend(&mut fields)?;
        if backend.is_playing() {
            return Ok(());
        }
        backend.play()?;
        self.context.add_player(self.id, backend);
        debug!("Player {} playing", self.id);
        Ok(())
    }

    /// Pause playback. No-op when already paused.
    pub fn pause(&self) {
        let fields = lock(&self.fields);
        if fields.closed {
            warn!("Player {}: pause after close ignored", self.id);
            return;
        }
        if let Some(backend) = &fields.backend {
            if backend.is_playing() {
                backend.pause();
                debug!("Player {} paused", self.id);
            }
        }
    }

    pub fn is_playing(&self) -> bool {
        let fields = lock(&self.fields);
        !fields.closed && fields.backend.as_ref().is_some_and(|b| b.is_playing())
    }

    pub fn state(&self) -> PlayerState {
        let fields = lock(&self.fields);
        if fields.closed {
            PlayerState::Closed
        } else if fields.backend.as_ref().is_some_and(|b| b.is_playing()) {
            PlayerState::Playing
        } else {
            PlayerState::Paused
        }
    }

    /// Move playback to `offset` from the start of the stream.
    ///
    /// The byte position keeps the stream's current sub-frame phase.
    pub fn seek(&self, offset: Duration) -> Result<()> {
        let mut fields = lock(&self.fields);
        if fields.closed {
            return Err(Error::PlayerClosed);
        }
        let pos = self.stream.time_to_pos(offset);
        match &fields.backend {
            Some(backend) => backend.seek(SeekFrom::Start(pos))?,
            None => self.stream.seek(SeekFrom::Start(pos))?,
        };
        fields.clock.pos = None;
        Ok(())
    }

    /// Seek to the start of the stream.
    pub fn rewind(&self) -> Result<()> {
        self.seek(Duration::ZERO)
    }

    /// Playback position: bytes read from the stream minus bytes still
    /// buffered, converted to time.
    pub fn position(&self) -> Duration {
        let mut fields = lock(&self.fields);
        let format = self.stream.format();
        let frame = format.frame_size() as u64;
        let (buffered, playing) = match &fields.backend {
            Some(backend) => (backend.buffered_size() as u64, backend.is_playing()),
            None => (0, false),
        };
        let pos = self.stream.current().saturating_sub(buffered);
        let base = frames_to_duration(pos / frame, &format);

        let now = Instant::now();
        let clock = &mut fields.clock;
        if clock.pos != Some(pos) || !playing || self.context.is_suspended() {
            clock.pos = Some(pos);
            clock.since = now;
            return base;
        }
        let limit = frames_to_duration(buffered / frame, &format);
        base + now.duration_since(clock.since).min(limit)
    }

    pub fn volume(&self) -> f64 {
        lock(&self.fields).volume
    }

    /// Set the volume in [0, 1].
    ///
    /// # Errors
    /// [`Error::VolumeOutOfRange`] for values outside [0, 1], including NaN.
    pub fn set_volume(&self, volume: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(Error::VolumeOutOfRange(volume));
        }
        let mut fields = lock(&self.fields);
        fields.volume = volume;
        if let Some(backend) = &fields.backend {
            backend.set_volume(volume);
        }
        Ok(())
    }

    /// Set how much audio the backend buffers ahead for this player.
    pub fn set_buffer_size(&self, buffer: Duration) {
        let format = self.stream.format();
        let bytes = (duration_to_bytes(buffer, &format) as usize).max(format.frame_size());
        let mut fields = lock(&self.fields);
        fields.buffer_size = Some(bytes);
        if let Some(backend) = &fields.backend {
            backend.set_buffer_size(bytes);
        }
    }

    /// Latched source or backend error.
    pub fn err(&self) -> Option<Error> {
        let fields = lock(&self.fields);
        fields
            .err
            .clone()
            .or_else(|| fields.backend.as_ref().and_then(|b| b.err()))
    }

    /// Stop playback and release the backend player and the source.
    ///
    /// Returns a latched error the first time; later calls return `Ok`.
    pub fn close(&self) -> Result<()> {
        let (backend, latched) = {
            let mut fields = lock(&self.fields);
            if fields.closed {
                return Ok(());
            }
            fields.closed = true;
            (fields.backend.clone(), fields.err.clone())
        };

        let mut result = match latched {
            Some(err) => Err(err),
            None => Ok(()),
        };
        if let Some(backend) = backend {
            backend.pause();
            if let Some(err) = backend.err() {
                if result.is_ok() {
                    result = Err(err);
                }
            }
            if let Err(e) = backend.close() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        if let Err(e) = self.stream.close() {
            if result.is_ok() {
                result = Err(e);
            }
        }
        self.context.release_player(self.id, self.source_id);
        debug!("Player {} closed", self.id);
        result
    }
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let detached = {
            let mut fields = lock(&self.fields);
            if fields.closed {
                return;
            }
            match &fields.backend {
                Some(backend) if backend.is_playing() => {
                    let backend = Arc::clone(backend);
                    fields.closed = true;
                    Some(backend)
                }
                _ => None,
            }
        };
        match detached {
            Some(backend) => {
                debug!("Player {} dropped while playing; detaching", self.id);
                backend.detach();
                self.context.release_player(self.id, self.source_id);
            }
            None => {
                if let Err(e) = self.close() {
                    warn!("Player {} dropped with error: {}", self.id, e);
                }
            }
        }
    }
}
