//! Command Line Interface.

use crate::config::{AppCfg, RecordMode};
use crate::error::Result;
use clap::Parser;
use std::path::PathBuf;

/// Plays an RTP/H.265 UDP stream on a KMS overlay plane, optionally recording
/// it to MP4.
#[derive(Parser, Debug)]
#[command(name = "pixelpilot_mini_rk", version, about)]
pub struct Cli {
    /// DRM card path (default: /dev/dri/card0)
    #[arg(long, value_name = "PATH")]
    pub card: Option<PathBuf>,
    /// Connector name, e.g. HDMI-A-1 (default: auto)
    #[arg(long, value_name = "NAME")]
    pub connector: Option<String>,
    /// Video plane ID (default: 76)
    #[arg(long, value_name = "N")]
    pub plane_id: Option<u32>,
    /// Load configuration from an INI file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// UDP listen port (default: 5600)
    #[arg(long, value_name = "N")]
    pub udp_port: Option<u16>,
    /// RTP payload type for video, -1 accepts any (default: 97)
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    pub vid_pt: Option<i32>,
    /// Max buffers queued on the appsink (default: 4)
    #[arg(long, value_name = "N")]
    pub appsink_max_buffers: Option<u32>,
    /// Enable MP4 recording, optionally to PATH
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub record_video: Option<Option<PathBuf>>,
    /// MP4 recording mode (standard|sequential|fragmented)
    #[arg(long, value_name = "MODE", value_parser = RecordMode::parse_cli)]
    pub record_mode: Option<RecordMode>,
    /// Disable MP4 recording
    #[arg(long)]
    pub no_record_video: bool,
    /// Export GST_DEBUG=3 when not already set
    #[arg(long)]
    pub gst_log: bool,
    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

impl Cli {
    /// Resolves defaults, the INI file and the CLI flags into an [`AppCfg`].
    ///
    /// The INI file is applied first and every flag the user actually passed
    /// is applied on top, so a CLI value always wins over an INI value.
    pub fn resolve(self) -> Result<AppCfg> {
        let mut cfg = AppCfg::default();
        if let Some(path) = &self.config {
            cfg.load_ini(path)?;
        }
        if let Some(card) = self.card {
            cfg.card_path = card;
        }
        if let Some(connector) = self.connector {
            cfg.connector = if connector.is_empty() { None } else { Some(connector) };
        }
        if let Some(plane_id) = self.plane_id {
            cfg.plane_id = plane_id;
        }
        if let Some(udp_port) = self.udp_port {
            cfg.udp_port = udp_port;
        }
        if let Some(vid_pt) = self.vid_pt {
            cfg.vid_pt = vid_pt;
        }
        if let Some(appsink_max_buffers) = self.appsink_max_buffers {
            cfg.appsink_max_buffers = appsink_max_buffers;
        }
        if let Some(record_video) = self.record_video {
            cfg.record.enable = true;
            if let Some(path) = record_video {
                cfg.record.output_path = path;
            }
        }
        if let Some(mode) = self.record_mode {
            cfg.record.mode = mode;
        }
        if self.no_record_video {
            cfg.record.enable = false;
        }
        if self.gst_log {
            cfg.gst_log = true;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("pixelpilot_mini_rk").chain(args.iter().copied()))
            .expect("CLI parse failed")
    }

    #[test]
    fn defaults_without_flags() {
        let cfg = parse(&[]).resolve().unwrap();
        assert_eq!(cfg, AppCfg::default());
    }

    #[test]
    fn record_video_without_path_keeps_default_path() {
        let cfg = parse(&["--record-video"]).resolve().unwrap();
        assert!(cfg.record.enable);
        assert_eq!(cfg.record.output_path, AppCfg::default().record.output_path);
    }

    #[test]
    fn record_video_with_path() {
        let cfg = parse(&["--record-video", "/tmp/clip.mp4"]).resolve().unwrap();
        assert!(cfg.record.enable);
        assert_eq!(cfg.record.output_path, PathBuf::from("/tmp/clip.mp4"));
    }

    #[test]
    fn record_video_does_not_swallow_following_flag() {
        let cfg = parse(&["--record-video", "--gst-log"]).resolve().unwrap();
        assert!(cfg.record.enable);
        assert!(cfg.gst_log);
        assert_eq!(cfg.record.output_path, AppCfg::default().record.output_path);
    }

    #[test]
    fn no_record_video_wins() {
        let cfg = parse(&["--record-video", "/tmp/clip.mp4", "--no-record-video"])
            .resolve()
            .unwrap();
        assert!(!cfg.record.enable);
    }

    #[test]
    fn record_mode_aliases_accepted() {
        let cfg = parse(&["--record-mode", "Fragment"]).resolve().unwrap();
        assert_eq!(cfg.record.mode, RecordMode::Fragmented);
        assert!(Cli::try_parse_from(["pixelpilot_mini_rk", "--record-mode", "bogus"]).is_err());
    }

    #[test]
    fn negative_payload_type_accepted() {
        let cfg = parse(&["--vid-pt", "-1"]).resolve().unwrap();
        assert_eq!(cfg.vid_pt, -1);
    }

    #[test]
    fn bad_integer_is_a_parse_error() {
        assert!(Cli::try_parse_from(["pixelpilot_mini_rk", "--udp-port", "lots"]).is_err());
    }

    #[test]
    fn cli_overrides_ini() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("pixelpilot-cli-test-{}.ini", std::process::id()));
        fs::write(
            &path,
            "[video]\nudp_port = 6000\nplane_id = 10\n[record]\nenable = true\nmode = standard\n",
        )
        .unwrap();

        let cfg = parse(&[
            "--config",
            path.to_str().unwrap(),
            "--udp-port",
            "7000",
            "--record-mode",
            "fragmented",
        ])
        .resolve()
        .unwrap();
        fs::remove_file(&path).unwrap();

        // CLI wins where given, INI fills the rest.
        assert_eq!(cfg.udp_port, 7000);
        assert_eq!(cfg.plane_id, 10);
        assert!(cfg.record.enable);
        assert_eq!(cfg.record.mode, RecordMode::Fragmented);
    }

    #[test]
    fn invalid_appsink_max_buffers_rejected() {
        assert!(parse(&["--appsink-max-buffers", "0"]).resolve().is_err());
    }
}
