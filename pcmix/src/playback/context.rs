//! Process-wide audio context
//!
//! The context owns the backend and the registry of playing players. There
//! is at most one live context per process: creating a second one while the
//! first is alive fails with [`Error::ContextExists`]. Closing a context
//! frees the slot.
//!
//! The backend is opened lazily, on the first play, and the ready signal
//! fires once it is up. A failed open is not remembered, so the next play
//! tries again.
//!
//! # Example
//!
//! ```rust,no_run
//! use pcmix::{Context, ContextConfig, ManualHost};
//!
//! # fn main() -> pcmix::Result<()> {
//! let host = ManualHost::new();
//! let context = Context::new(ContextConfig::default(), host.clone())?;
//! let player = context.new_player_from_bytes(vec![0u8; 44100 * 4])?;
//! player.play()?;
//! host.update()?;
//! # Ok(())
//! # }
//! ```

use crate::audio::{BytesSource, Source, SourceId, TimeStream};
use crate::backend::{
    open_backend, Backend, BackendConfig, BackendKind, BackendPlayer, CpalDeviceFactory,
    DeviceFactory, MemoryDeviceFactory,
};
use crate::error::{Error, ErrorLatch, Result};
use crate::playback::host::Host;
use crate::playback::player::{Player, PlayerId};
use crate::sync::{lock, OneShot};
use pcmix_common::config::{AudioConfig, DeviceSelection};
use pcmix_common::{SampleFormat, StreamFormat};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// The live context, if any
static CURRENT: Mutex<Option<Weak<ContextInner>>> = Mutex::new(None);

/// Size of the silent player used to kick backend initialization
const KICK_BYTES: usize = 16384;

/// Context construction parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ContextConfig {
    /// Sample rate every source must match
    pub sample_rate: u32,
    /// Sample depth of every source
    pub sample_format: SampleFormat,
    pub backend: BackendConfig,
    pub device: DeviceSelection,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            sample_format: SampleFormat::Int16,
            backend: BackendConfig::default(),
            device: DeviceSelection::Default,
        }
    }
}

impl ContextConfig {
    pub fn new(sample_rate: u32, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            sample_format,
            ..Self::default()
        }
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_device(mut self, device: DeviceSelection) -> Self {
        self.device = device;
        self
    }

    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat::new(self.sample_rate, self.sample_format)
    }
}

impl From<&AudioConfig> for ContextConfig {
    fn from(audio: &AudioConfig) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            sample_format: audio.sample_format,
            backend: BackendConfig {
                kind: BackendKind::from(audio.backend),
                output_format: Some(audio.output_format),
                buffer: Duration::from_millis(audio.buffer_ms),
            },
            device: audio.device_selection(),
        }
    }
}

#[derive(Default)]
struct Registry {
    /// Players registered on play; kept alive until they stop
    players: HashMap<PlayerId, Arc<dyn BackendPlayer>>,
    /// Source identities attached to players
    sources: HashMap<SourceId, PlayerId>,
    closed: bool,
}

pub(crate) struct ContextInner {
    format: StreamFormat,
    config: BackendConfig,
    factory: Arc<dyn DeviceFactory>,
    backend: Mutex<Option<Arc<dyn Backend>>>,
    registry: Mutex<Registry>,
    ready: OneShot,
    kicked: AtomicBool,
    suspended: AtomicBool,
    next_id: AtomicU64,
    latch: ErrorLatch,
}

impl ContextInner {
    fn is_closed(&self) -> bool {
        lock(&self.registry).closed
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Open the backend if it is not open yet.
    pub(crate) fn ensure_backend(&self) -> Result<Arc<dyn Backend>> {
        let mut slot = lock(&self.backend);
        if let Some(backend) = slot.as_ref() {
            return Ok(Arc::clone(backend));
        }
        if self.is_closed() {
            return Err(Error::ContextClosed);
        }
        let backend = open_backend(&self.config, self.format, Arc::clone(&self.factory))?;
        if self.is_suspended() {
            if let Err(e) = backend.suspend() {
                warn!("Failed to suspend new backend: {}", e);
            }
        }
        *slot = Some(Arc::clone(&backend));
        drop(slot);
        info!("Audio context ready: {} backend, {}", backend.kind(), self.format);
        self.ready.fire();
        Ok(backend)
    }

    fn current_backend(&self) -> Option<Arc<dyn Backend>> {
        lock(&self.backend).clone()
    }

    pub(crate) fn err(&self) -> Option<Error> {
        self.latch
            .get()
            .or_else(|| self.current_backend().and_then(|b| b.err()))
    }

    pub(crate) fn add_player(&self, id: PlayerId, player: Arc<dyn BackendPlayer>) {
        lock(&self.registry).players.insert(id, player);
    }

    /// Forget the source identity held by a closed or detached player.
    pub(crate) fn release_player(&self, id: PlayerId, source: Option<SourceId>) {
        if let Some(source) = source {
            let mut registry = lock(&self.registry);
            if registry.sources.get(&source) == Some(&id) {
                registry.sources.remove(&source);
            }
        }
    }

    fn new_player(self: &Arc<Self>, source: Box<dyn Source>) -> Result<Player> {
        if let Some(actual) = source.format() {
            if actual != self.format {
                return Err(Error::FormatMismatch {
                    expected: self.format,
                    actual,
                });
            }
        }

        let id = PlayerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let identity = source.identity();
        {
            let mut registry = lock(&self.registry);
            if registry.closed {
                return Err(Error::ContextClosed);
            }
            if let Some(identity) = identity {
                if registry.sources.contains_key(&identity) {
                    return Err(Error::SourceShared);
                }
                registry.sources.insert(identity, id);
            }
        }

        let stream = match TimeStream::new(source, self.format) {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                self.release_player(id, identity);
                return Err(e);
            }
        };
        debug!("Created player {}", id);
        Ok(Player::new(id, Arc::clone(self), stream, identity))
    }

    /// Drop players that stopped or finished; report the first error one hit.
    fn gc_players(&self) -> Result<()> {
        let players: Vec<(PlayerId, Arc<dyn BackendPlayer>)> = lock(&self.registry)
            .players
            .iter()
            .map(|(id, p)| (*id, Arc::clone(p)))
            .collect();

        let mut finished = Vec::new();
        let mut first_err = None;
        for (id, player) in players {
            if player.is_playing() {
                continue;
            }
            if let Some(err) = player.err() {
                first_err.get_or_insert(err);
            }
            finished.push(id);
        }

        if !finished.is_empty() {
            let mut registry = lock(&self.registry);
            for id in &finished {
                registry.players.remove(id);
            }
            debug!("Collected {} finished players", finished.len());
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn suspend(&self) -> Result<()> {
        self.suspended.store(true, Ordering::Release);
        match self.current_backend() {
            Some(backend) => backend.suspend(),
            None => Ok(()),
        }
    }

    fn resume(&self) -> Result<()> {
        self.suspended.store(false, Ordering::Release);
        let Some(backend) = self.current_backend() else {
            return Ok(());
        };
        if let Err(e) = backend.resume() {
            warn!("Audio resume failed: {}", e);
            self.latch.set(e.clone());
            return Err(e);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let players = {
            let mut registry = lock(&self.registry);
            if registry.closed {
                return Ok(());
            }
            registry.closed = true;
            registry.sources.clear();
            std::mem::take(&mut registry.players)
        };
        for player in players.values() {
            player.pause();
        }

        let backend = lock(&self.backend).take();
        let result = match backend {
            Some(backend) => backend.close(),
            None => Ok(()),
        };

        let mut current = lock(&CURRENT);
        if current
            .as_ref()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), self))
        {
            *current = None;
        }
        info!("Audio context closed");
        result
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Error closing audio context: {}", e);
        }
    }
}

/// Handle onto the process-wide audio context.
///
/// Clones refer to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Create the context, opening devices as `config.device` selects.
    ///
    /// # Errors
    /// [`Error::ContextExists`] when another context is alive,
    /// [`Error::Config`] for an unusable sample rate.
    pub fn new(config: ContextConfig, host: Arc<dyn Host>) -> Result<Self> {
        let factory: Arc<dyn DeviceFactory> = match &config.device {
            DeviceSelection::Default => Arc::new(CpalDeviceFactory::new(None)),
            DeviceSelection::Named(name) => Arc::new(CpalDeviceFactory::new(Some(name.clone()))),
            DeviceSelection::Null => Arc::new(MemoryDeviceFactory::null()),
        };
        Self::with_device_factory(config, host, factory)
    }

    /// Create the context on an explicit device factory.
    pub fn with_device_factory(
        config: ContextConfig,
        host: Arc<dyn Host>,
        factory: Arc<dyn DeviceFactory>,
    ) -> Result<Self> {
        if config.sample_rate == 0 {
            return Err(Error::Config("sample rate must be positive".to_string()));
        }

        let mut current = lock(&CURRENT);
        // No upgrade here: dropping the last reference would re-enter this lock.
        if current.as_ref().is_some_and(|weak| weak.strong_count() > 0) {
            return Err(Error::ContextExists);
        }

        let inner = Arc::new(ContextInner {
            format: config.stream_format(),
            config: config.backend.clone(),
            factory,
            backend: Mutex::new(None),
            registry: Mutex::new(Registry::default()),
            ready: OneShot::new(),
            kicked: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            latch: ErrorLatch::new(),
        });

        let weak = Arc::downgrade(&inner);
        host.on_suspend_audio(Arc::new(move || match weak.upgrade() {
            Some(context) => context.suspend(),
            None => Ok(()),
        }));
        let weak = Arc::downgrade(&inner);
        host.on_resume_audio(Arc::new(move || match weak.upgrade() {
            Some(context) => context.resume(),
            None => Ok(()),
        }));
        let weak = Arc::downgrade(&inner);
        host.append_before_update(Arc::new(move || match weak.upgrade() {
            Some(context) => context.gc_players(),
            None => Ok(()),
        }));

        *current = Some(Arc::downgrade(&inner));
        info!(
            "Audio context created: {}, {} backend",
            inner.format, config.backend.kind
        );
        Ok(Self { inner })
    }

    /// The live context, if one exists.
    pub fn current() -> Option<Context> {
        lock(&CURRENT)
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Context { inner })
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.format.sample_rate
    }

    pub fn format(&self) -> StreamFormat {
        self.inner.format
    }

    /// Create a paused player reading `source`.
    ///
    /// # Errors
    /// - [`Error::ContextClosed`] after [`Context::close`]
    /// - [`Error::FormatMismatch`] when the source declares another format
    /// - [`Error::SourceShared`] when the same source instance already backs
    ///   a player
    pub fn new_player<S: Source + 'static>(&self, source: S) -> Result<Player> {
        self.inner.new_player(Box::new(source))
    }

    /// Create a paused player over decoded PCM bytes.
    pub fn new_player_from_bytes(&self, bytes: impl Into<Arc<[u8]>>) -> Result<Player> {
        self.new_player(BytesSource::new(bytes))
    }

    /// Whether the backend has finished initializing.
    ///
    /// Before any player exists this starts a short silent player so the
    /// backend gets opened.
    pub fn is_ready(&self) -> bool {
        if self.inner.ready.is_fired() {
            return true;
        }
        let idle = lock(&self.inner.registry).players.is_empty();
        if idle && !self.inner.kicked.swap(true, Ordering::AcqRel) {
            match self.new_player_from_bytes(vec![0u8; KICK_BYTES]) {
                Ok(player) => {
                    if let Err(e) = player.play() {
                        debug!("Backend kick failed: {}", e);
                        self.inner.kicked.store(false, Ordering::Release);
                    }
                }
                Err(e) => debug!("Backend kick failed: {}", e),
            }
        }
        self.inner.ready.is_fired()
    }

    /// Block until the backend is ready or `timeout` passes.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        self.is_ready() || self.inner.ready.wait(timeout)
    }

    /// Players registered as playing since the last update tick.
    pub fn active_player_count(&self) -> usize {
        lock(&self.inner.registry).players.len()
    }

    /// First persistent context or backend error.
    pub fn err(&self) -> Option<Error> {
        self.inner.err()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.config.kind
    }

    /// Close the backend and free the process-wide slot. Idempotent.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Forcibly close and forget the live context.
    #[doc(hidden)]
    pub fn reset_for_testing() {
        let live = lock(&CURRENT).take().and_then(|weak| weak.upgrade());
        if let Some(inner) = live {
            let _ = inner.close();
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("format", &self.inner.format)
            .field("backend", &self.inner.config.kind)
            .finish()
    }
}
