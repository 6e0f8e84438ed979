//! Backend wrapper shared by the dialects that feed one mixed stream

use crate::audio::TimeStream;
use crate::backend::driver::DriverHandle;
use crate::backend::{Backend, BackendKind, BackendPlayer};
use crate::error::{Error, Result};
use crate::playback::mixer::Mixer;
use crate::playback::PlayerId;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct MixedBackend {
    kind: BackendKind,
    mixer: Arc<Mixer>,
    driver: DriverHandle,
}

impl MixedBackend {
    pub(crate) fn new(kind: BackendKind, mixer: Arc<Mixer>, driver: DriverHandle) -> Self {
        Self {
            kind,
            mixer,
            driver,
        }
    }
}

impl Backend for MixedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn new_player(&self, id: PlayerId, stream: Arc<TimeStream>) -> Result<Arc<dyn BackendPlayer>> {
        if let Some(err) = self.driver.err() {
            return Err(err);
        }
        debug!("{} backend: new player {}", self.kind, id);
        let player: Arc<dyn BackendPlayer> = self.mixer.new_player(id, stream);
        Ok(player)
    }

    fn suspend(&self) -> Result<()> {
        self.driver.suspend()
    }

    fn resume(&self) -> Result<()> {
        let result = self.driver.resume();
        self.driver.wake();
        result
    }

    fn err(&self) -> Option<Error> {
        self.driver.err()
    }

    fn close(&self) -> Result<()> {
        let result = self.driver.close();
        self.mixer.clear();
        result
    }
}
