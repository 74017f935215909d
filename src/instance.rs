//! Single-instance guard backed by a PID file.

use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Default PID file location.
pub const DEFAULT_PID_PATH: &str = "/tmp/pixelpilot_mini_rk.pid";

/// Holds the PID file for the lifetime of the process; the file is removed on
/// drop.
#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
}

impl InstanceGuard {
    /// Atomically creates the PID file, refusing to start when a live
    /// instance already owns it and reclaiming it from a dead one.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    if let Err(err) = writeln!(file, "{}", std::process::id()) {
                        let _ = fs::remove_file(&path);
                        return Err(Error::SingleInstance(format!(
                            "failed to write {}: {err}",
                            path.display()
                        )));
                    }
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if let Some(pid) = read_pid(&path) {
                        if process_alive(pid) {
                            return Err(Error::SingleInstance(format!(
                                "an existing instance is already running (pid {pid})"
                            )));
                        }
                    }
                    tracing::info!(path = %path.display(), "removing stale PID file");
                    if let Err(err) = fs::remove_file(&path) {
                        if err.kind() != ErrorKind::NotFound {
                            return Err(Error::SingleInstance(format!(
                                "failed to clear stale PID file {}: {err}",
                                path.display()
                            )));
                        }
                    }
                }
                Err(err) => {
                    return Err(Error::SingleInstance(format!(
                        "failed to create {}: {err}",
                        path.display()
                    )));
                }
            }
        }
    }

    /// Path of the held PID file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "failed to remove PID file: {err}");
            }
        }
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path)
        .ok()?
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
}

fn process_alive(pid: i32) -> bool {
    // Signal 0 probes for existence; EPERM means it exists but is not ours.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
