//! pixelpilot_mini_rk entry point: wires the CLI, the single-instance guard,
//! the signal watcher and the display target to the pipeline supervisor, then
//! runs the intent-polling loop.

use clap::Parser as _;
use eyre::{eyre, Result};
use pixelpilot_mini_rk::cli::Cli;
use pixelpilot_mini_rk::config::AppCfg;
use pixelpilot_mini_rk::display::DisplayTarget;
use pixelpilot_mini_rk::instance::{InstanceGuard, DEFAULT_PID_PATH};
use pixelpilot_mini_rk::logger;
use pixelpilot_mini_rk::pipeline::{Pipeline, PipelineStatus, DEFAULT_STOP_WAIT};
use pixelpilot_mini_rk::signals::{self, Intents, SignalWatcher};
use pixelpilot_mini_rk::video::{Decoder, KmsDecoder, Mp4Recorder, Recorder};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const SUPERVISOR_POLL: Duration = Duration::from_millis(200);
const STOP_HARD_DEADLINE: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    logger::init(cli.verbose);

    let cfg = match cli.resolve() {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!("{err}");
            std::process::exit(2);
        }
    };
    cfg.export_gst_debug();

    let _instance = InstanceGuard::acquire(DEFAULT_PID_PATH)?;

    // Block the supervised signals before any other thread exists so only
    // the watcher receives them.
    let mask = signals::blocked_mask().map_err(|err| eyre!("failed to block signals: {err}"))?;
    let intents = Arc::new(Intents::default());
    let watcher = SignalWatcher::spawn(mask, Arc::clone(&intents))?;

    let result = run(cfg, &intents);
    watcher.shutdown();
    if result.is_ok() {
        tracing::info!("bye");
    }
    result
}

fn run(mut cfg: AppCfg, intents: &Intents) -> Result<()> {
    gstreamer::init()?;
    let display = DisplayTarget::open(&cfg)?;

    let mut pipeline = Pipeline::new(
        Box::new(move |cfg: &AppCfg| {
            Ok(Box::new(KmsDecoder::new(cfg, &display)?) as Box<dyn Decoder>)
        }),
        Box::new(|record| Ok(Box::new(Mp4Recorder::new(record)?) as Box<dyn Recorder>)),
    );
    pipeline.start(&cfg)?;

    if cfg.record.enable {
        if let Err(err) = pipeline.enable_recording(&cfg.record) {
            tracing::warn!("failed to start MP4 recorder; continuing without recording: {err}");
        }
    }

    loop {
        thread::sleep(SUPERVISOR_POLL);

        if intents.exit() {
            tracing::info!("exit requested; preparing to stop pipeline");
            break;
        }

        if intents.take_record_on() {
            if cfg.record.enable {
                tracing::info!("recording already enabled");
            } else {
                cfg.record.enable = true;
                tracing::info!("enabling MP4 recording");
            }
            if pipeline.status() == PipelineStatus::Running {
                if let Err(err) = pipeline.enable_recording(&cfg.record) {
                    tracing::warn!("failed to enable recording on running pipeline: {err}");
                }
            }
        }

        if intents.take_record_off() {
            if cfg.record.enable {
                cfg.record.enable = false;
                tracing::info!("disabling MP4 recording");
            } else {
                tracing::info!("recording already disabled");
            }
            if pipeline.status() == PipelineStatus::Running {
                pipeline.disable_recording();
            }
        }

        if intents.take_restart() {
            tracing::info!("restarting pipeline");
            pipeline.stop(DEFAULT_STOP_WAIT);
            if let Err(err) = pipeline.start(&cfg) {
                tracing::error!("pipeline restart failed: {err}");
                intents.request_exit();
            } else if cfg.record.enable {
                if let Err(err) = pipeline.enable_recording(&cfg.record) {
                    tracing::warn!("failed to re-enable recording after restart: {err}");
                }
            }
        }

        pipeline.poll_child();
        if pipeline.status() == PipelineStatus::Stopped {
            tracing::info!("pipeline stopped; exiting main loop");
            break;
        }
    }

    tracing::info!("stopping pipeline");
    stop_with_deadline(pipeline);
    tracing::info!("pipeline stopped");
    Ok(())
}

/// Runs the graceful stop on a worker and enforces a hard deadline: a stop
/// that wedges must not leave the process hanging.
fn stop_with_deadline(mut pipeline: Pipeline) {
    let (done_tx, done_rx) = mpsc::channel();
    let worker = thread::Builder::new()
        .name("pipeline-stop".into())
        .spawn(move || {
            pipeline.stop(DEFAULT_STOP_WAIT);
            drop(pipeline);
            let _ = done_tx.send(());
        });
    match worker {
        Ok(handle) => {
            if done_rx.recv_timeout(STOP_HARD_DEADLINE).is_err() {
                tracing::error!("pipeline stop timed out; forcing process exit");
                std::process::exit(128);
            }
            let _ = handle.join();
        }
        Err(err) => {
            // The pipeline moved into the dropped closure; its Drop ran the
            // stop inline.
            tracing::error!("failed to spawn pipeline stop worker: {err}");
        }
    }
}
