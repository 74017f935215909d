//! H.265 decoder adapter rendering onto a KMS plane.

use super::{Decoder, FeedStatus};
use crate::config::AppCfg;
use crate::display::DisplayTarget;
use crate::error::{Error, Result};
use gstreamer::prelude::*;
use gstreamer::{Caps, ElementFactory};
use gstreamer_app::AppSrc;

/// Pending bytes on the decode appsrc above which feeds report busy instead
/// of queueing further.
const FEED_SOFT_CAP_BYTES: u64 = 4 * 1024 * 1024;

/// Largest access unit the decode chain is fed.
const MAX_PACKET_BYTES: usize = 1024 * 1024;

/// Decoder rendering byte-stream H.265 access units onto the configured
/// overlay plane through `mppvideodec` (Rockchip) or `avdec_h265`.
#[derive(Debug)]
pub struct KmsDecoder {
    pipeline: gstreamer::Pipeline,
    appsrc: AppSrc,
}

impl KmsDecoder {
    /// Builds the decode chain for the given display target.
    pub fn new(cfg: &AppCfg, target: &DisplayTarget) -> Result<Self> {
        gstreamer::init().map_err(|err| Error::DecoderInit(err.to_string()))?;

        let pipeline = gstreamer::Pipeline::with_name("kms_decode");

        let caps = Caps::builder("video/x-h265")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build();
        let appsrc = AppSrc::builder()
            .name("decode_src")
            .caps(&caps)
            .format(gstreamer::Format::Time)
            .is_live(true)
            .block(false)
            .build();

        let decode = select_h265_decoder()?;
        let convert = make_element("videoconvert")?;
        let sink = make_element("kmssink")?;

        let plane_id = i32::try_from(target.plane_id())
            .map_err(|_| Error::DecoderInit(format!("plane id {} out of range", target.plane_id())))?;
        sink.set_property("plane-id", plane_id);
        sink.set_property("force-modesetting", true);
        sink.set_property("sync", false);
        if let Some(connector) = target.connector() {
            // kmssink selects connectors by id, not name; the preference is
            // logged and the sink picks the connected output.
            tracing::debug!(connector, "connector preference noted; sink auto-selects");
        }
        tracing::info!(
            card = %target.card_path().display(),
            plane_id,
            vid_pt = cfg.vid_pt,
            "initialising KMS decode chain"
        );

        pipeline
            .add_many([appsrc.upcast_ref(), &decode, &convert, &sink])
            .map_err(|err| Error::DecoderInit(err.to_string()))?;
        gstreamer::Element::link_many([appsrc.upcast_ref(), &decode, &convert, &sink])
            .map_err(|err| Error::DecoderInit(format!("failed to link decode chain: {err}")))?;

        Ok(Self { pipeline, appsrc })
    }
}

impl Decoder for KmsDecoder {
    fn max_packet_size(&self) -> usize {
        MAX_PACKET_BYTES
    }

    fn start(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|err| Error::DecoderStart(format!("decode chain refused PLAYING: {err}")))?;
        Ok(())
    }

    fn feed(&mut self, data: &[u8], pts: Option<gstreamer::ClockTime>) -> FeedStatus {
        if self.appsrc.current_level_bytes() > FEED_SOFT_CAP_BYTES {
            return FeedStatus::Busy;
        }
        let mut buffer = gstreamer::Buffer::from_slice(data.to_vec());
        buffer.get_mut().unwrap().set_pts(pts);
        match self.appsrc.push_buffer(buffer) {
            Ok(_) => FeedStatus::Accepted,
            Err(flow) => {
                tracing::debug!("decode appsrc push returned {flow:?}");
                FeedStatus::Busy
            }
        }
    }

    fn send_eos(&mut self) {
        let _ = self.appsrc.end_of_stream();
    }

    fn stop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

impl Drop for KmsDecoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

fn select_h265_decoder() -> Result<gstreamer::Element> {
    for factory in ["mppvideodec", "avdec_h265"] {
        if let Ok(element) = ElementFactory::make(factory).build() {
            tracing::debug!(factory, "selected H.265 decoder");
            return Ok(element);
        }
    }
    Err(Error::DecoderInit(
        "no H.265 decoder element available".into(),
    ))
}

fn make_element(factory: &str) -> Result<gstreamer::Element> {
    ElementFactory::make(factory)
        .build()
        .map_err(|_| Error::DecoderInit(format!("failed to create element '{factory}'")))
}
