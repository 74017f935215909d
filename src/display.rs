//! Display target resolution.
//!
//! The atomic modeset itself belongs to the video sink; this module opens the
//! DRM card node and carries the connector/plane selection as the opaque
//! handle the decoder adapter consumes.

use crate::config::AppCfg;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Opaque handle for the display output the decoder renders onto.
///
/// Holds the card node open for the lifetime of the pipeline.
#[derive(Debug)]
pub struct DisplayTarget {
    _card: File,
    card_path: PathBuf,
    connector: Option<String>,
    plane_id: u32,
}

impl DisplayTarget {
    /// Opens the configured DRM card and captures the connector/plane
    /// selection.
    pub fn open(cfg: &AppCfg) -> Result<Self> {
        let card = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&cfg.card_path)
            .map_err(|err| {
                Error::Display(format!("open {}: {err}", cfg.card_path.display()))
            })?;
        Ok(Self {
            _card: card,
            card_path: cfg.card_path.clone(),
            connector: cfg.connector.clone(),
            plane_id: cfg.plane_id,
        })
    }

    /// Path of the card node.
    #[must_use]
    pub fn card_path(&self) -> &Path {
        &self.card_path
    }

    /// Requested connector name; `None` lets the sink pick.
    #[must_use]
    pub fn connector(&self) -> Option<&str> {
        self.connector.as_deref()
    }

    /// Overlay plane the video is rendered onto.
    #[must_use]
    pub fn plane_id(&self) -> u32 {
        self.plane_id
    }
}
