//! Error kinds surfaced by the ingest core.

use thiserror::Error;

/// Failures surfaced by the ingest core.
///
/// Start-path errors unwind fully and reach the caller; steady-state errors
/// are logged as [`Error::Transient`] and swallowed.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad CLI or INI configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// Another instance already holds the PID file.
    #[error("single instance check failed: {0}")]
    SingleInstance(String),
    /// The display target could not be opened.
    #[error("display setup failed: {0}")]
    Display(String),
    /// The UDP socket could not be created or configured.
    #[error("socket setup failed: {0}")]
    SocketSetup(#[source] std::io::Error),
    /// A streaming-graph element could not be created.
    #[error("graph build failed: {0}")]
    GraphBuild(String),
    /// Streaming-graph elements could not be linked.
    #[error("graph link failed: {0}")]
    GraphLink(String),
    /// The streaming graph refused a state transition.
    #[error("graph state change failed: {0}")]
    GraphState(String),
    /// The video decoder could not be initialised.
    #[error("decoder init failed: {0}")]
    DecoderInit(String),
    /// The video decoder could not be started.
    #[error("decoder start failed: {0}")]
    DecoderStart(String),
    /// A worker thread could not be spawned.
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(#[source] std::io::Error),
    /// Transient runtime failure, logged but not fatal.
    #[error("transient error: {0}")]
    Transient(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
