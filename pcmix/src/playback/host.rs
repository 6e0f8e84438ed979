//! Host integration hooks
//!
//! The context registers three callbacks with its host: suspend and resume
//! when the host loses or regains audio focus, and a before-update hook run
//! once per host tick. [`ManualHost`] stores them and lets the caller fire
//! them, which is all a CLI or a test harness needs.

use crate::error::Result;
use crate::sync::lock;
use std::sync::{Arc, Mutex};

/// A host callback
pub type Hook = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Extension points a host offers to the audio context.
pub trait Host: Send + Sync {
    fn on_suspend_audio(&self, hook: Hook);
    fn on_resume_audio(&self, hook: Hook);
    fn append_before_update(&self, hook: Hook);
}

/// Host whose events are triggered explicitly.
#[derive(Default)]
pub struct ManualHost {
    suspend: Mutex<Vec<Hook>>,
    resume: Mutex<Vec<Hook>>,
    before_update: Mutex<Vec<Hook>>,
}

impl ManualHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run the suspend hooks.
    pub fn suspend_audio(&self) -> Result<()> {
        run(&self.suspend)
    }

    /// Run the resume hooks.
    pub fn resume_audio(&self) -> Result<()> {
        run(&self.resume)
    }

    /// One host tick: run the before-update hooks.
    pub fn update(&self) -> Result<()> {
        run(&self.before_update)
    }
}

/// Run every hook, returning the first error.
fn run(hooks: &Mutex<Vec<Hook>>) -> Result<()> {
    // Hooks may register further hooks; don't hold the lock while running.
    let hooks: Vec<Hook> = lock(hooks).clone();
    let mut result = Ok(());
    for hook in hooks {
        if let Err(e) = hook() {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

impl Host for ManualHost {
    fn on_suspend_audio(&self, hook: Hook) {
        lock(&self.suspend).push(hook);
    }

    fn on_resume_audio(&self, hook: Hook) {
        lock(&self.resume).push(hook);
    }

    fn append_before_update(&self, hook: Hook) {
        lock(&self.before_update).push(hook);
    }
}
