//! MP4 recorder adapter.

use super::{Recorder, RecorderStats};
use crate::config::{RecordCfg, RecordMode};
use crate::error::{Error, Result};
use gstreamer::prelude::*;
use gstreamer::{Caps, ElementFactory};
use gstreamer_app::AppSrc;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Moov update cadence for crash-robust sequential recordings.
const MOOV_UPDATE_PERIOD_NS: u64 = 1_000_000_000;
/// Fragment length for fragmented recordings, in milliseconds.
const FRAGMENT_DURATION_MS: u32 = 2000;

/// MP4 writer muxing byte-stream H.265 access units into a file.
#[derive(Debug)]
pub struct Mp4Recorder {
    pipeline: gstreamer::Pipeline,
    appsrc: AppSrc,
    output_path: PathBuf,
    started_at: Instant,
    first_pts: Option<gstreamer::ClockTime>,
    last_pts: Option<gstreamer::ClockTime>,
    bytes_written: u64,
}

impl Mp4Recorder {
    /// Builds the mux chain and starts it; the file is created immediately.
    pub fn new(cfg: &RecordCfg) -> Result<Self> {
        gstreamer::init().map_err(|err| Error::Transient(err.to_string()))?;

        let output_path = resolve_output_path(&cfg.output_path);
        let pipeline = gstreamer::Pipeline::with_name("mp4_record");

        let caps = Caps::builder("video/x-h265")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let appsrc = AppSrc::builder()
            .name("record_src")
            .caps(&caps)
            .format(gstreamer::Format::Time)
            .build();

        let parser = make_element("h265parse")?;
        let mux = make_element("mp4mux")?;
        match cfg.mode {
            RecordMode::Standard => {}
            RecordMode::Sequential => {
                mux.set_property("reserved-moov-update-period", MOOV_UPDATE_PERIOD_NS);
            }
            RecordMode::Fragmented => {
                mux.set_property("fragment-duration", FRAGMENT_DURATION_MS);
            }
        }
        let filesink = make_element("filesink")?;
        filesink.set_property("location", output_path.to_string_lossy().as_ref());

        pipeline
            .add_many([appsrc.upcast_ref(), &parser, &mux, &filesink])
            .map_err(|err| Error::Transient(err.to_string()))?;
        gstreamer::Element::link_many([appsrc.upcast_ref(), &parser, &mux, &filesink])
            .map_err(|err| Error::Transient(format!("failed to link mux chain: {err}")))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|err| Error::Transient(format!("mux chain refused PLAYING: {err}")))?;

        tracing::info!(
            output = %output_path.display(),
            mode = cfg.mode.name(),
            "MP4 recording started"
        );

        Ok(Self {
            pipeline,
            appsrc,
            output_path,
            started_at: Instant::now(),
            first_pts: None,
            last_pts: None,
            bytes_written: 0,
        })
    }
}

impl Recorder for Mp4Recorder {
    fn handle_sample(&mut self, sample: &gstreamer::Sample, data: &[u8]) {
        let Some(buffer) = sample.buffer() else {
            return;
        };
        let pts = buffer.pts().or_else(|| buffer.dts());
        if self.first_pts.is_none() {
            self.first_pts = pts;
        }
        // The muxer wants a timeline starting at zero.
        let rebased = match (pts, self.first_pts) {
            (Some(pts), Some(first)) => pts.checked_sub(first),
            _ => None,
        };
        if let (Some(pts), Some(first)) = (pts, self.first_pts) {
            if pts >= first {
                self.last_pts = Some(pts);
            }
        }

        let mut out = gstreamer::Buffer::from_slice(data.to_vec());
        {
            let out = out.get_mut().unwrap();
            out.set_pts(rebased);
            out.set_dts(rebased);
        }
        match self.appsrc.push_buffer(out) {
            Ok(_) => self.bytes_written += data.len() as u64,
            Err(flow) => tracing::debug!("recorder push returned {flow:?}"),
        }
    }

    fn stats(&self) -> RecorderStats {
        RecorderStats {
            active: true,
            bytes_written: self.bytes_written,
            elapsed: self.started_at.elapsed(),
            media_duration: match (self.first_pts, self.last_pts) {
                (Some(first), Some(last)) => last.checked_sub(first),
                _ => None,
            },
            output_path: self.output_path.clone(),
        }
    }
}

impl Drop for Mp4Recorder {
    fn drop(&mut self) {
        // Finalise the moov before tearing the chain down so the file stays
        // playable.
        let _ = self.appsrc.end_of_stream();
        if let Some(bus) = self.pipeline.bus() {
            let _ = bus.timed_pop_filtered(
                gstreamer::ClockTime::from_seconds(2),
                &[gstreamer::MessageType::Eos, gstreamer::MessageType::Error],
            );
        }
        let _ = self.pipeline.set_state(gstreamer::State::Null);
        tracing::info!(output = %self.output_path.display(), "MP4 recording closed");
    }
}

fn resolve_output_path(configured: &Path) -> PathBuf {
    if configured.is_dir() {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        configured.join(format!("pixelpilot_{stamp}.mp4"))
    } else {
        configured.to_path_buf()
    }
}

fn make_element(factory: &str) -> Result<gstreamer::Element> {
    ElementFactory::make(factory)
        .build()
        .map_err(|_| Error::Transient(format!("failed to create element '{factory}'")))
}
