//! Collaborator interfaces for the hardware decoder and the MP4 recorder.
//!
//! The pipeline supervisor only depends on the traits here; the concrete
//! adapters ([`KmsDecoder`], [`Mp4Recorder`]) are constructed by the binary
//! and injected through factories, which is also how tests substitute fakes.

pub mod decoder;
pub mod recorder;

pub use decoder::KmsDecoder;
pub use recorder::Mp4Recorder;

use crate::error::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Outcome of feeding one access unit to the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedStatus {
    /// The access unit was queued for decode.
    Accepted,
    /// The decoder is backed up; the access unit was dropped, not retried.
    Busy,
}

/// Hardware video decoder rendering onto the display overlay.
pub trait Decoder: Send {
    /// Largest access unit in bytes the decoder accepts; 0 means
    /// unspecified and the consumer falls back to 1 MiB.
    fn max_packet_size(&self) -> usize;

    /// Starts consuming access units.
    fn start(&mut self) -> Result<()>;

    /// Feeds one Annex-B access unit with its presentation timestamp.
    fn feed(&mut self, data: &[u8], pts: Option<gstreamer::ClockTime>) -> FeedStatus;

    /// Signals end of stream.
    fn send_eos(&mut self);

    /// Stops and releases decoder resources.
    fn stop(&mut self);
}

/// MP4 writer consuming access units while recording is enabled.
pub trait Recorder: Send {
    /// Writes one access unit.
    fn handle_sample(&mut self, sample: &gstreamer::Sample, data: &[u8]);

    /// Snapshot of the writer's rolling statistics.
    fn stats(&self) -> RecorderStats;
}

/// Rolling statistics of an active recording.
#[derive(Clone, Debug, Default)]
pub struct RecorderStats {
    /// Whether the writer is currently accepting samples.
    pub active: bool,
    /// Payload bytes handed to the writer so far.
    pub bytes_written: u64,
    /// Wall-clock time since the writer was created.
    pub elapsed: Duration,
    /// Media time covered by the written samples.
    pub media_duration: Option<gstreamer::ClockTime>,
    /// File the recording is written to.
    pub output_path: PathBuf,
}
