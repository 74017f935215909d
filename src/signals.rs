//! Signal handling: a dedicated watcher thread turns process signals into
//! supervisor intents.
//!
//! The signal mask is blocked on the main thread before anything else is
//! spawned, so every worker inherits it and only the watcher ever receives
//! the signals.

use crate::error::{Error, Result};
use nix::sys::pthread::pthread_kill;
use nix::sys::signal::{SigSet, Signal};
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Supervisor intents raised from the signal watcher and polled by the main
/// loop.
#[derive(Debug, Default)]
pub struct Intents {
    exit: AtomicBool,
    restart: AtomicBool,
    record_on: AtomicBool,
    record_off: AtomicBool,
}

impl Intents {
    /// Raises the exit intent.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    /// Whether exit has been requested. Exit is level-triggered and never
    /// cleared.
    #[must_use]
    pub fn exit(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Raises the restart intent.
    pub fn request_restart(&self) {
        self.restart.store(true, Ordering::Release);
    }

    /// Consumes a pending restart intent.
    pub fn take_restart(&self) -> bool {
        self.restart.swap(false, Ordering::AcqRel)
    }

    /// Raises the recording-enable intent.
    pub fn request_record_on(&self) {
        self.record_on.store(true, Ordering::Release);
    }

    /// Consumes a pending recording-enable intent.
    pub fn take_record_on(&self) -> bool {
        self.record_on.swap(false, Ordering::AcqRel)
    }

    /// Raises the recording-disable intent.
    pub fn request_record_off(&self) {
        self.record_off.store(true, Ordering::Release);
    }

    /// Consumes a pending recording-disable intent.
    pub fn take_record_off(&self) -> bool {
        self.record_off.swap(false, Ordering::AcqRel)
    }
}

/// Builds the supervised signal set and blocks it in the calling thread.
///
/// Must run on the main thread before any other thread is spawned.
pub fn blocked_mask() -> nix::Result<SigSet> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(Signal::SIGHUP);
    mask.add(Signal::SIGUSR1);
    mask.add(Signal::SIGUSR2);
    mask.thread_block()?;
    Ok(mask)
}

/// Handle for the signal watcher thread.
#[derive(Debug)]
pub struct SignalWatcher {
    handle: thread::JoinHandle<()>,
}

impl SignalWatcher {
    /// Spawns the watcher thread waiting on `mask`.
    pub fn spawn(mask: SigSet, intents: Arc<Intents>) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("signal-watcher".into())
            .spawn(move || watch(&mask, &intents))
            .map_err(Error::ThreadSpawn)?;
        Ok(Self { handle })
    }

    /// Wakes the watcher with SIGTERM and joins it.
    pub fn shutdown(self) {
        let _ = pthread_kill(self.handle.as_pthread_t(), Signal::SIGTERM);
        let _ = self.handle.join();
    }
}

fn watch(mask: &SigSet, intents: &Intents) {
    loop {
        match mask.wait() {
            Ok(Signal::SIGINT) => {
                tracing::info!("SIGINT received; shutting down");
                intents.request_exit();
            }
            Ok(Signal::SIGTERM) => {
                tracing::info!("SIGTERM received; shutting down");
                intents.request_exit();
                break;
            }
            Ok(Signal::SIGHUP) => {
                tracing::info!("SIGHUP received; scheduling pipeline restart");
                intents.request_restart();
            }
            Ok(Signal::SIGUSR1) => {
                tracing::info!("SIGUSR1 received; enabling recording");
                intents.request_record_on();
            }
            Ok(Signal::SIGUSR2) => {
                tracing::info!("SIGUSR2 received; disabling recording");
                intents.request_record_off();
            }
            Ok(signal) => {
                tracing::warn!(?signal, "signal watcher: unhandled signal");
            }
            Err(err) => {
                tracing::warn!("signal watcher: sigwait failed: {err}");
            }
        }
    }
}
