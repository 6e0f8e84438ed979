//! Backend loop plumbing shared by the mixed-stream dialects
//!
//! Each dialect runs one loop thread that owns its device. User threads
//! reach it through [`Control`]: suspend, resume and close are queued as
//! requests and answered over a reply channel, so the device is only ever
//! touched by the loop. Device "bytes consumed" callbacks and mixer changes
//! wake the loop through the same condition variable.

use crate::backend::device::{Device, DeviceError, Notifier};
use crate::error::{Error, ErrorLatch, Result};
use crate::sync::{lock, wait_timeout};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// How long a caller waits for the loop to answer a request
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait slice while the loop has nothing to play
pub(crate) const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Resume attempts on transient errors, and the pause between them
const RESUME_ATTEMPTS: usize = 3;
const RESUME_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Suspend,
    Resume,
    Close,
}

pub(crate) struct Request {
    pub(crate) command: Command,
    reply: mpsc::SyncSender<Result<()>>,
}

impl Request {
    pub(crate) fn reply(self, result: Result<()>) {
        // The caller may have timed out and gone away.
        let _ = self.reply.send(result);
    }
}

#[derive(Default)]
struct ControlState {
    requests: VecDeque<Request>,
    woken: bool,
    disconnected: bool,
}

/// Request queue and wakeup signal for one loop thread.
#[derive(Default)]
pub(crate) struct Control {
    state: Mutex<ControlState>,
    cond: Condvar,
}

impl Control {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Notifier that wakes the loop; holds only a weak reference.
    pub(crate) fn notifier(self: &Arc<Self>) -> Notifier {
        let weak = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(control) = weak.upgrade() {
                control.wake();
            }
        })
    }

    pub(crate) fn wake(&self) {
        let mut state = lock(&self.state);
        state.woken = true;
        self.cond.notify_all();
    }

    /// Queue `command` and wait for the loop's answer.
    ///
    /// Returns `None` when the loop has already exited.
    fn request(&self, command: Command) -> Option<Result<()>> {
        let (reply, answer) = mpsc::sync_channel(1);
        {
            let mut state = lock(&self.state);
            if state.disconnected {
                return None;
            }
            state.requests.push_back(Request { command, reply });
            self.cond.notify_all();
        }
        match answer.recv_timeout(REPLY_TIMEOUT) {
            Ok(result) => Some(result),
            Err(mpsc::RecvTimeoutError::Disconnected) => None,
            Err(mpsc::RecvTimeoutError::Timeout) => Some(Err(Error::BackendRuntime(format!(
                "audio loop did not answer {:?} within {:?}",
                command, REPLY_TIMEOUT
            )))),
        }
    }

    /// Pending requests, without waiting.
    pub(crate) fn take_requests(&self) -> Vec<Request> {
        let mut state = lock(&self.state);
        state.woken = false;
        state.requests.drain(..).collect()
    }

    /// Wait until a request arrives, the loop is woken, or `timeout` passes.
    pub(crate) fn wait(&self, timeout: Duration) -> Vec<Request> {
        let mut state = lock(&self.state);
        if state.requests.is_empty() && !state.woken {
            state = wait_timeout(&self.cond, state, timeout);
        }
        state.woken = false;
        state.requests.drain(..).collect()
    }

    /// Refuse further requests; returns the ones still queued.
    fn disconnect(&self) -> Vec<Request> {
        let mut state = lock(&self.state);
        state.disconnected = true;
        state.requests.drain(..).collect()
    }
}

/// Owner's side of a backend loop thread.
pub(crate) struct DriverHandle {
    control: Arc<Control>,
    latch: Arc<ErrorLatch>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl DriverHandle {
    /// Spawn the loop thread running `body`.
    pub(crate) fn spawn<F>(
        name: &str,
        control: Arc<Control>,
        latch: Arc<ErrorLatch>,
        body: F,
    ) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let exit_control = Arc::clone(&control);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                body();
                for request in exit_control.disconnect() {
                    request.reply(Ok(()));
                }
            })
            .map_err(|e| Error::BackendInit(format!("Failed to spawn {}: {}", name, e)))?;
        Ok(Self {
            control,
            latch,
            thread: Mutex::new(Some(thread)),
            closed: AtomicBool::new(false),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        match self.control.request(command) {
            Some(result) => result,
            None => match self.latch.get() {
                Some(err) => Err(err),
                None => Ok(()),
            },
        }
    }

    pub(crate) fn suspend(&self) -> Result<()> {
        self.send(Command::Suspend)
    }

    pub(crate) fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    pub(crate) fn err(&self) -> Option<Error> {
        self.latch.get()
    }

    pub(crate) fn wake(&self) {
        self.control.wake();
    }

    /// Stop the loop and wait for it to exit. Later calls are no-ops.
    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.send(Command::Close);
        if let Some(thread) = lock(&self.thread).take() {
            if thread.thread().id() == thread::current().id() {
                debug!("Backend closed from its own loop; not joining");
            } else if thread.join().is_err() {
                error!("Audio loop thread panicked");
            }
        }
        result
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Stop the device for a host suspend: pause if possible, otherwise drop
/// what is queued. Always succeeds.
pub(crate) fn suspend_device(device: &mut dyn Device) -> Result<()> {
    match device.pause() {
        Ok(()) => {}
        Err(DeviceError::NotSupported(_)) => {
            debug!("Device cannot pause, dropping queued audio instead");
            if let Err(e) = device.drop_queued() {
                warn!("Failed to drop queued audio on suspend: {}", e);
            }
        }
        Err(e) => warn!("Failed to pause device on suspend: {}", e),
    }
    Ok(())
}

/// Restart the device after a suspend.
///
/// Transient failures are retried a few times; a device that cannot resume
/// is re-prepared instead.
pub(crate) fn resume_device(device: &mut dyn Device) -> Result<()> {
    let mut attempt = 1;
    loop {
        match device.resume() {
            Ok(()) => return Ok(()),
            Err(DeviceError::NotSupported(_)) => {
                debug!("Device cannot resume, preparing it instead");
                return device.prepare().map_err(Error::from);
            }
            Err(e @ (DeviceError::Busy | DeviceError::Underrun)) if attempt < RESUME_ATTEMPTS => {
                warn!("Resume attempt {} failed ({}), retrying", attempt, e);
                attempt += 1;
                thread::sleep(RESUME_BACKOFF);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Write all of `data`, recovering once from an underrun.
pub(crate) fn write_recovering(device: &mut dyn Device, data: &[u8]) -> std::result::Result<(), DeviceError> {
    match device.write(data) {
        Ok(_) => Ok(()),
        Err(DeviceError::Underrun) => {
            warn!("Audio underrun, preparing device");
            device.prepare()?;
            device.write(data).map(|_| ())
        }
        Err(e) => Err(e),
    }
}

/// After a fatal error: keep answering requests until closed.
pub(crate) fn serve_failed(control: &Control, latch: &ErrorLatch) {
    loop {
        for request in control.wait(IDLE_WAIT) {
            match request.command {
                Command::Close => {
                    request.reply(Ok(()));
                    return;
                }
                _ => {
                    let err = latch
                        .get()
                        .unwrap_or_else(|| Error::BackendRuntime("audio loop failed".to_string()));
                    request.reply(Err(err));
                }
            }
        }
    }
}
