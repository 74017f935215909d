//! Pipeline supervisor: graph lifecycle, access-unit consumer, bus monitor
//! and the recording toggle.
//!
//! The graph is `appsrc → queue → rtpjitterbuffer → rtph265depay → h265parse
//! → capsfilter → appsink`. The UDP receiver pushes into the `appsrc`; a
//! consumer thread pulls access units from the `appsink` and feeds the
//! decoder (and the recorder while one is installed); a bus thread folds
//! asynchronous errors and end-of-stream into the shared stop flags.

use crate::config::{AppCfg, RecordCfg};
use crate::error::{Error, Result};
use crate::ingress::UdpReceiver;
use crate::video::{Decoder, FeedStatus, Recorder, RecorderStats};
use gstreamer::prelude::*;
use gstreamer::{Caps, ElementFactory};
use gstreamer_app::{AppSink, AppSrc, AppStreamType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

/// Default time the supervisor waits for the bus thread during stop.
pub const DEFAULT_STOP_WAIT: Duration = Duration::from_millis(700);

/// Constructs a decoder for a (re)starting pipeline.
pub type DecoderFactory = Box<dyn Fn(&AppCfg) -> Result<Box<dyn Decoder>> + Send>;
/// Constructs a recorder when recording is enabled.
pub type RecorderFactory = Box<dyn Fn(&RecordCfg) -> Result<Box<dyn Recorder>> + Send>;

/// Externally observable pipeline lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStatus {
    /// No graph exists and no worker threads are alive.
    Stopped,
    /// The graph is live and the workers are running.
    Running,
    /// A stop is in progress.
    Stopping,
}

#[derive(Debug, Default)]
struct Flags {
    stop_requested: bool,
    encountered_error: bool,
    bus_running: bool,
    decoder_running: bool,
}

#[derive(Debug, Default)]
struct Shared {
    flags: Mutex<Flags>,
    cond: Condvar,
    oversized_skipped: AtomicU64,
}

type RecorderSlot = Arc<Mutex<Option<Box<dyn Recorder>>>>;

struct Graph {
    pipeline: gstreamer::Pipeline,
    appsink: AppSink,
    receiver: UdpReceiver,
}

/// Owns the streaming graph, its worker threads and the recording slot.
pub struct Pipeline {
    status: PipelineStatus,
    shared: Arc<Shared>,
    recorder: RecorderSlot,
    graph: Option<Graph>,
    consumer: Option<thread::JoinHandle<Box<dyn Decoder>>>,
    bus_worker: Option<thread::JoinHandle<()>>,
    decoder_factory: DecoderFactory,
    recorder_factory: RecorderFactory,
}

impl Pipeline {
    /// Creates a stopped pipeline wired to the given collaborator factories.
    #[must_use]
    pub fn new(decoder_factory: DecoderFactory, recorder_factory: RecorderFactory) -> Self {
        Self {
            status: PipelineStatus::Stopped,
            shared: Arc::new(Shared::default()),
            recorder: Arc::new(Mutex::new(None)),
            graph: None,
            consumer: None,
            bus_worker: None,
            decoder_factory,
            recorder_factory,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    /// Whether the bus observed a fatal graph error this lifecycle.
    #[must_use]
    pub fn encountered_error(&self) -> bool {
        self.shared.flags.lock().unwrap().encountered_error
    }

    /// Access units skipped because they exceeded the decoder's packet limit.
    #[must_use]
    pub fn oversized_skipped(&self) -> u64 {
        self.shared.oversized_skipped.load(Ordering::Relaxed)
    }

    /// Builds and starts the graph, the UDP receiver, the decoder and the
    /// worker threads. Fails unless the pipeline is stopped; any failure
    /// rewinds every resource created so far.
    pub fn start(&mut self, cfg: &AppCfg) -> Result<()> {
        if self.status != PipelineStatus::Stopped {
            tracing::warn!(status = ?self.status, "pipeline start refused");
            return Err(Error::GraphState("pipeline is not stopped".into()));
        }
        {
            let mut flags = self.shared.flags.lock().unwrap();
            *flags = Flags::default();
        }
        self.shared.oversized_skipped.store(0, Ordering::Relaxed);
        match self.start_inner(cfg) {
            Ok(()) => {
                self.status = PipelineStatus::Running;
                Ok(())
            }
            Err(err) => {
                self.teardown();
                Err(err)
            }
        }
    }

    fn start_inner(&mut self, cfg: &AppCfg) -> Result<()> {
        gstreamer::init().map_err(|err| Error::GraphBuild(err.to_string()))?;

        let (pipeline, appsrc, appsink) = build_graph(cfg)?;
        let mut receiver = UdpReceiver::new(cfg.udp_port, cfg.vid_pt, appsrc);
        receiver.start()?;
        self.graph = Some(Graph {
            pipeline,
            appsink,
            receiver,
        });

        self.set_playing()?;

        let mut decoder = (self.decoder_factory)(cfg)?;
        decoder.start()?;
        self.shared.flags.lock().unwrap().decoder_running = true;

        let (appsink, bus) = {
            let graph = self.graph.as_ref().unwrap();
            let bus = graph
                .pipeline
                .bus()
                .ok_or_else(|| Error::GraphBuild("pipeline has no bus".into()))?;
            (graph.appsink.clone(), bus)
        };

        let shared = Arc::clone(&self.shared);
        let recorder = Arc::clone(&self.recorder);
        self.consumer = Some(
            thread::Builder::new()
                .name("au-consumer".into())
                .spawn(move || consumer_loop(&appsink, decoder, &shared, &recorder))
                .map_err(Error::ThreadSpawn)?,
        );

        // Marked running by the supervisor so a poll between spawn and the
        // thread's first instruction cannot look like an exit.
        self.shared.flags.lock().unwrap().bus_running = true;
        let shared = Arc::clone(&self.shared);
        self.bus_worker = Some(
            thread::Builder::new()
                .name("pipeline-bus".into())
                .spawn(move || bus_loop(&bus, &shared))
                .map_err(Error::ThreadSpawn)?,
        );
        Ok(())
    }

    fn set_playing(&self) -> Result<()> {
        let graph = self.graph.as_ref().unwrap();
        match graph.pipeline.set_state(gstreamer::State::Playing) {
            Ok(gstreamer::StateChangeSuccess::Async) => {
                let (result, _, _) = graph.pipeline.state(gstreamer::ClockTime::from_seconds(1));
                result
                    .map(|_| ())
                    .map_err(|_| Error::GraphState("PLAYING transition did not complete".into()))
            }
            Ok(_) => Ok(()),
            Err(_) => Err(Error::GraphState(
                "failed to set pipeline to PLAYING".into(),
            )),
        }
    }

    /// Stops the graph and joins every worker, waiting up to `wait` for the
    /// bus thread. No-op when already stopped.
    pub fn stop(&mut self, wait: Duration) {
        if self.status == PipelineStatus::Stopped {
            return;
        }
        self.status = PipelineStatus::Stopping;
        self.shared.flags.lock().unwrap().stop_requested = true;

        if let Some(graph) = self.graph.as_mut() {
            graph.pipeline.send_event(gstreamer::event::Eos::new());
            let _ = graph.pipeline.set_state(gstreamer::State::Null);
            graph.receiver.stop();
        }

        self.join_consumer();
        self.wait_bus_exit(wait);
        self.join_bus();
        self.teardown();
        self.status = PipelineStatus::Stopped;
    }

    /// Non-blocking check for a bus thread that exited on its own (error or
    /// end-of-stream); tears the pipeline down when it has.
    pub fn poll_child(&mut self) {
        if self.bus_worker.is_none() {
            return;
        }
        let (bus_running, had_error) = {
            let flags = self.shared.flags.lock().unwrap();
            (flags.bus_running, flags.encountered_error)
        };
        if bus_running {
            return;
        }
        self.join_bus();
        self.teardown();
        self.status = PipelineStatus::Stopped;
        if had_error {
            tracing::info!("pipeline exited due to error");
        } else {
            tracing::info!("pipeline exited cleanly");
        }
    }

    /// Installs a recorder built from `cfg` unless one is already installed;
    /// enabling twice discards the new writer without side effects.
    pub fn enable_recording(&self, cfg: &RecordCfg) -> Result<()> {
        if cfg.output_path.as_os_str().is_empty() {
            return Err(Error::Config("recording requires an output path".into()));
        }
        let writer = (self.recorder_factory)(cfg)?;
        let mut slot = self.recorder.lock().unwrap();
        if slot.is_some() {
            drop(slot);
            drop(writer);
            return Ok(());
        }
        *slot = Some(writer);
        Ok(())
    }

    /// Detaches the recorder, if any, and destroys it outside the lock.
    /// Idempotent.
    pub fn disable_recording(&self) {
        let writer = self.recorder.lock().unwrap().take();
        drop(writer);
    }

    /// Snapshot of the active recording's statistics, if one is installed.
    #[must_use]
    pub fn recording_stats(&self) -> Option<RecorderStats> {
        self.recorder.lock().unwrap().as_ref().map(|rec| rec.stats())
    }

    fn join_consumer(&mut self) {
        if let Some(handle) = self.consumer.take() {
            if let Ok(mut decoder) = handle.join() {
                decoder.stop();
            }
        }
    }

    fn wait_bus_exit(&self, wait: Duration) {
        let guard = self.shared.flags.lock().unwrap();
        let _ = self
            .shared
            .cond
            .wait_timeout_while(guard, wait, |flags| flags.bus_running);
    }

    fn join_bus(&mut self) {
        if let Some(handle) = self.bus_worker.take() {
            let _ = handle.join();
        }
    }

    fn teardown(&mut self) {
        {
            let mut flags = self.shared.flags.lock().unwrap();
            flags.stop_requested = true;
        }
        self.join_consumer();
        self.join_bus();
        if let Some(mut graph) = self.graph.take() {
            graph.receiver.stop();
            let _ = graph.pipeline.set_state(gstreamer::State::Null);
        }
        let writer = self.recorder.lock().unwrap().take();
        drop(writer);
        let mut flags = self.shared.flags.lock().unwrap();
        flags.decoder_running = false;
        flags.bus_running = false;
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop(DEFAULT_STOP_WAIT);
    }
}

fn build_graph(cfg: &AppCfg) -> Result<(gstreamer::Pipeline, AppSrc, AppSink)> {
    let pipeline = gstreamer::Pipeline::with_name("pixelpilot_ingest");

    // A live RTP source that never back-pressures the receive thread.
    let rtp_caps = Caps::builder("application/x-rtp")
        .field("media", "video")
        .field("encoding-name", "H265")
        .field("payload", cfg.vid_pt)
        .field("clock-rate", 90_000i32)
        .build();
    let appsrc = AppSrc::builder()
        .name("udp_appsrc")
        .caps(&rtp_caps)
        .is_live(true)
        .format(gstreamer::Format::Time)
        .stream_type(AppStreamType::Stream)
        .block(false)
        .max_bytes(0)
        .build();
    appsrc.set_property("do-timestamp", true);

    let queue = make_element("queue", "udp_queue")?;
    let jitterbuf = make_element("rtpjitterbuffer", "jitter")?;
    let depay = make_element("rtph265depay", "video_depay")?;
    let parser = make_element("h265parse", "video_parser")?;
    let capsfilter = make_element("capsfilter", "video_capsfilter")?;

    // Head queue: unbounded, dropping its oldest buffer on any overrun.
    queue.set_property_from_str("leaky", "downstream");
    queue.set_property("max-size-time", 0u64);
    queue.set_property("max-size-bytes", 0u32);
    queue.set_property("max-size-buffers", 0u32);

    // Tiny jitter buffer: absorbs bursts, keeps latency low. Late packets
    // still propagate; the decoder decides what to do with them.
    jitterbuf.set_property("latency", 10u32);
    jitterbuf.set_property("do-lost", true);
    jitterbuf.set_property("drop-on-latency", false);
    jitterbuf.set_property_from_str("mode", "buffer");

    parser.set_property("config-interval", -1i32);
    parser.set_property("disable-passthrough", true);

    let au_caps = Caps::builder("video/x-h265")
        .field("stream-format", "byte-stream")
        .field("alignment", "au")
        .build();
    capsfilter.set_property("caps", &au_caps);

    let appsink = AppSink::builder().name("video_sink").build();
    appsink.set_caps(Some(&au_caps));
    appsink.set_max_buffers(cfg.appsink_max_buffers);
    appsink.set_drop(true);
    appsink.set_property("sync", false);

    pipeline
        .add_many([
            appsrc.upcast_ref(),
            &queue,
            &jitterbuf,
            &depay,
            &parser,
            &capsfilter,
            appsink.upcast_ref(),
        ])
        .map_err(|err| Error::GraphBuild(err.to_string()))?;
    gstreamer::Element::link_many([
        appsrc.upcast_ref(),
        &queue,
        &jitterbuf,
        &depay,
        &parser,
        &capsfilter,
        appsink.upcast_ref(),
    ])
    .map_err(|err| Error::GraphLink(err.to_string()))?;

    Ok((pipeline, appsrc, appsink))
}

fn make_element(factory: &str, name: &str) -> Result<gstreamer::Element> {
    ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|_| Error::GraphBuild(format!("failed to create element '{factory}'")))
}

fn consumer_loop(
    appsink: &AppSink,
    mut decoder: Box<dyn Decoder>,
    shared: &Shared,
    recorder: &Mutex<Option<Box<dyn Recorder>>>,
) -> Box<dyn Decoder> {
    let mut max_packet = decoder.max_packet_size();
    if max_packet == 0 {
        max_packet = 1024 * 1024;
    }

    loop {
        {
            let flags = shared.flags.lock().unwrap();
            if flags.stop_requested || !flags.decoder_running {
                break;
            }
        }

        let Some(sample) = appsink.try_pull_sample(gstreamer::ClockTime::from_mseconds(100))
        else {
            continue;
        };
        let Some(buffer) = sample.buffer() else {
            continue;
        };
        let pts = buffer.pts().or_else(|| buffer.dts());
        let Ok(map) = buffer.map_readable() else {
            continue;
        };
        let data = map.as_slice();
        if data.is_empty() {
            continue;
        }
        if data.len() > max_packet {
            shared.oversized_skipped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                size = data.len(),
                max_packet,
                "skipping oversized access unit"
            );
            continue;
        }

        // Held only for this one delivery, so toggling recording races with
        // delivery only at access-unit boundaries.
        {
            let mut slot = recorder.lock().unwrap();
            if let Some(writer) = slot.as_mut() {
                writer.handle_sample(&sample, data);
            }
        }

        if decoder.feed(data, pts) == FeedStatus::Busy {
            tracing::debug!("decoder feed busy; dropping access unit");
        }
    }

    decoder.send_eos();
    decoder
}

fn bus_loop(bus: &gstreamer::Bus, shared: &Shared) {
    loop {
        let Some(msg) = bus.timed_pop(gstreamer::ClockTime::from_mseconds(100)) else {
            if shared.flags.lock().unwrap().stop_requested {
                break;
            }
            continue;
        };
        match msg.view() {
            gstreamer::MessageView::Error(err) => {
                tracing::error!("pipeline error: {}", err.error());
                if let Some(debug) = err.debug() {
                    tracing::debug!("pipeline debug info: {debug}");
                }
                let mut flags = shared.flags.lock().unwrap();
                flags.encountered_error = true;
                flags.stop_requested = true;
                break;
            }
            gstreamer::MessageView::Eos(..) => {
                tracing::info!("pipeline received end of stream");
                shared.flags.lock().unwrap().stop_requested = true;
                break;
            }
            _ => {}
        }
    }

    let mut flags = shared.flags.lock().unwrap();
    flags.bus_running = false;
    shared.cond.notify_all();
}
