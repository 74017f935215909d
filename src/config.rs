//! Application configuration: defaults, INI file loading and the record-mode
//! table.
//!
//! Resolution order is defaults → INI file (when `--config` is given) → CLI
//! flags, with the CLI winning on any overlapping key. The merge lives in
//! [`crate::cli`]; this module owns the types and the INI grammar.

use crate::error::{Error, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// MP4 recording mode carried through to the recorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordMode {
    /// Plain MP4 with the moov written on finalise.
    Standard,
    /// MP4 with periodic moov updates so a crash leaves a playable file.
    Sequential,
    /// Fragmented MP4.
    Fragmented,
}

impl RecordMode {
    /// Parses a record-mode name, accepting the documented aliases
    /// case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "standard" | "default" => Some(Self::Standard),
            "sequential" | "append" => Some(Self::Sequential),
            "fragmented" | "fragment" => Some(Self::Fragmented),
            _ => None,
        }
    }

    /// Canonical name of the mode.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Sequential => "sequential",
            Self::Fragmented => "fragmented",
        }
    }

    /// Clap value parser for `--record-mode`.
    pub fn parse_cli(value: &str) -> std::result::Result<Self, String> {
        Self::parse(value).ok_or_else(|| format!("unknown record mode: {value}"))
    }
}

/// MP4 recording configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordCfg {
    /// Whether recording starts enabled.
    pub enable: bool,
    /// Output file, or a directory to place a timestamped file in.
    pub output_path: PathBuf,
    /// Muxing mode.
    pub mode: RecordMode,
}

impl Default for RecordCfg {
    fn default() -> Self {
        Self {
            enable: false,
            output_path: PathBuf::from("/media"),
            mode: RecordMode::Sequential,
        }
    }
}

/// Resolved application configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppCfg {
    /// DRM card node.
    pub card_path: PathBuf,
    /// Connector name, e.g. `HDMI-A-1`; `None` selects automatically.
    pub connector: Option<String>,
    /// Overlay plane id.
    pub plane_id: u32,
    /// UDP listen port.
    pub udp_port: u16,
    /// Expected RTP payload type; negative accepts every payload type.
    pub vid_pt: i32,
    /// Maximum buffers queued on the access-unit sink.
    pub appsink_max_buffers: u32,
    /// Export `GST_DEBUG=3` when the environment does not set it.
    pub gst_log: bool,
    /// Recording settings.
    pub record: RecordCfg,
}

impl Default for AppCfg {
    fn default() -> Self {
        Self {
            card_path: PathBuf::from("/dev/dri/card0"),
            connector: None,
            plane_id: 76,
            udp_port: 5600,
            vid_pt: 97,
            appsink_max_buffers: 4,
            gst_log: false,
            record: RecordCfg::default(),
        }
    }
}

impl AppCfg {
    /// Loads an INI file over the current settings.
    ///
    /// Unknown keys and malformed lines are logged and skipped; only a file
    /// that cannot be read is an error.
    pub fn load_ini(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("failed to read {}: {err}", path.display())))?;
        self.apply_ini(&text);
        Ok(())
    }

    /// Applies INI text over the current settings.
    ///
    /// Sections `[video]` and `[record]` are recognised; keys before any
    /// section header are treated as video keys, and dotted `record.*` keys
    /// are accepted there as well. Keys are case-insensitive, comments start
    /// with `#` or `;`.
    pub fn apply_ini(&mut self, text: &str) {
        let mut section = String::new();
        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let line = line.split(['#', ';']).next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                match rest.find(']') {
                    Some(end) => section = rest[..end].trim().to_ascii_lowercase(),
                    None => tracing::warn!(line_no, "config: missing ']'"),
                }
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                tracing::warn!(line_no, "config: missing '='");
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let value = value.trim();
            if key.is_empty() {
                continue;
            }
            let handled = match section.as_str() {
                "record" => self.apply_record_key(&key, value),
                _ => self.apply_video_key(&key, value),
            };
            if !handled {
                tracing::warn!(line_no, key, "config: unrecognised key");
            }
        }
    }

    fn apply_video_key(&mut self, key: &str, value: &str) -> bool {
        match key {
            "card_path" => {
                self.card_path = PathBuf::from(value);
                true
            }
            "connector" | "connector_name" => {
                self.connector = if value.is_empty() { None } else { Some(value.to_owned()) };
                true
            }
            "plane_id" => assign_int(key, value, &mut self.plane_id),
            "udp_port" => assign_int(key, value, &mut self.udp_port),
            "vid_pt" | "video_payload_type" => assign_int(key, value, &mut self.vid_pt),
            "appsink_max_buffers" => assign_int(key, value, &mut self.appsink_max_buffers),
            "gst_log" => assign_bool(key, value, &mut self.gst_log),
            _ => key
                .strip_prefix("record.")
                .is_some_and(|sub| self.apply_record_key(sub, value)),
        }
    }

    fn apply_record_key(&mut self, key: &str, value: &str) -> bool {
        match key {
            "enable" => assign_bool(key, value, &mut self.record.enable),
            "output_path" | "path" => {
                self.record.output_path = PathBuf::from(value);
                true
            }
            "mode" => match RecordMode::parse(value) {
                Some(mode) => {
                    self.record.mode = mode;
                    true
                }
                None => {
                    tracing::warn!(value, "config: invalid record mode");
                    false
                }
            },
            _ => false,
        }
    }

    /// Renders the current settings as INI text that [`Self::apply_ini`]
    /// reads back unchanged.
    #[must_use]
    pub fn to_ini_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[video]");
        let _ = writeln!(out, "card_path = {}", self.card_path.display());
        if let Some(connector) = &self.connector {
            let _ = writeln!(out, "connector = {connector}");
        }
        let _ = writeln!(out, "plane_id = {}", self.plane_id);
        let _ = writeln!(out, "udp_port = {}", self.udp_port);
        let _ = writeln!(out, "vid_pt = {}", self.vid_pt);
        let _ = writeln!(out, "appsink_max_buffers = {}", self.appsink_max_buffers);
        let _ = writeln!(out, "gst_log = {}", self.gst_log);
        let _ = writeln!(out);
        let _ = writeln!(out, "[record]");
        let _ = writeln!(out, "enable = {}", self.record.enable);
        let _ = writeln!(out, "output_path = {}", self.record.output_path.display());
        let _ = writeln!(out, "mode = {}", self.record.mode.name());
        out
    }

    /// Rejects settings no pipeline can be built from.
    pub fn validate(&self) -> Result<()> {
        if self.appsink_max_buffers == 0 {
            return Err(Error::Config(
                "appsink_max_buffers must be a positive integer".into(),
            ));
        }
        if self.vid_pt > 127 {
            return Err(Error::Config(format!(
                "vid_pt {} does not fit the 7-bit RTP payload-type field",
                self.vid_pt
            )));
        }
        Ok(())
    }

    /// Exports `GST_DEBUG=3` when `gst_log` is set and the environment does
    /// not already define it.
    pub fn export_gst_debug(&self) {
        if self.gst_log && std::env::var_os("GST_DEBUG").is_none() {
            std::env::set_var("GST_DEBUG", "3");
        }
    }
}

fn assign_int<T: std::str::FromStr>(key: &str, value: &str, out: &mut T) -> bool {
    match value.parse() {
        Ok(parsed) => {
            *out = parsed;
            true
        }
        Err(_) => {
            tracing::warn!(key, value, "config: invalid integer");
            false
        }
    }
}

fn assign_bool(key: &str, value: &str, out: &mut bool) -> bool {
    let parsed = if value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value == "0"
    {
        Some(false)
    } else {
        None
    };
    match parsed {
        Some(parsed) => {
            *out = parsed;
            true
        }
        None => {
            tracing::warn!(key, value, "config: invalid boolean");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_mode_aliases() {
        assert_eq!(RecordMode::parse("standard"), Some(RecordMode::Standard));
        assert_eq!(RecordMode::parse("default"), Some(RecordMode::Standard));
        assert_eq!(RecordMode::parse("sequential"), Some(RecordMode::Sequential));
        assert_eq!(RecordMode::parse("append"), Some(RecordMode::Sequential));
        assert_eq!(RecordMode::parse("fragmented"), Some(RecordMode::Fragmented));
        assert_eq!(RecordMode::parse("fragment"), Some(RecordMode::Fragmented));
        assert_eq!(RecordMode::parse("FRAGMENTED"), Some(RecordMode::Fragmented));
        assert_eq!(RecordMode::parse("mp4"), None);
    }

    #[test]
    fn record_mode_name_round_trips() {
        for mode in [
            RecordMode::Standard,
            RecordMode::Sequential,
            RecordMode::Fragmented,
        ] {
            assert_eq!(RecordMode::parse(mode.name()), Some(mode));
        }
    }

    #[test]
    fn defaults() {
        let cfg = AppCfg::default();
        assert_eq!(cfg.card_path, PathBuf::from("/dev/dri/card0"));
        assert_eq!(cfg.connector, None);
        assert_eq!(cfg.plane_id, 76);
        assert_eq!(cfg.udp_port, 5600);
        assert_eq!(cfg.vid_pt, 97);
        assert_eq!(cfg.appsink_max_buffers, 4);
        assert!(!cfg.gst_log);
        assert!(!cfg.record.enable);
        assert_eq!(cfg.record.mode, RecordMode::Sequential);
    }

    #[test]
    fn ini_sections_and_aliases() {
        let mut cfg = AppCfg::default();
        cfg.apply_ini(
            "# full-line comment\n\
             [video]\n\
             card_path = /dev/dri/card1\n\
             CONNECTOR_NAME = HDMI-A-1\n\
             plane_id = 44   ; trailing comment\n\
             udp_port = 6000\n\
             video_payload_type = 96\n\
             appsink_max_buffers = 8\n\
             gst_log = yes\n\
             \n\
             [record]\n\
             enable = 1\n\
             path = /tmp/out.mp4\n\
             mode = FRAGMENT\n",
        );
        assert_eq!(cfg.card_path, PathBuf::from("/dev/dri/card1"));
        assert_eq!(cfg.connector.as_deref(), Some("HDMI-A-1"));
        assert_eq!(cfg.plane_id, 44);
        assert_eq!(cfg.udp_port, 6000);
        assert_eq!(cfg.vid_pt, 96);
        assert_eq!(cfg.appsink_max_buffers, 8);
        assert!(cfg.gst_log);
        assert!(cfg.record.enable);
        assert_eq!(cfg.record.output_path, PathBuf::from("/tmp/out.mp4"));
        assert_eq!(cfg.record.mode, RecordMode::Fragmented);
    }

    #[test]
    fn ini_global_keys_and_dotted_record_keys() {
        let mut cfg = AppCfg::default();
        cfg.apply_ini(
            "udp_port = 7000\n\
             record.enable = true\n\
             record.output_path = /tmp/global.mp4\n\
             record.mode = append\n",
        );
        assert_eq!(cfg.udp_port, 7000);
        assert!(cfg.record.enable);
        assert_eq!(cfg.record.output_path, PathBuf::from("/tmp/global.mp4"));
        assert_eq!(cfg.record.mode, RecordMode::Sequential);
    }

    #[test]
    fn ini_tolerates_malformed_lines() {
        let mut cfg = AppCfg::default();
        cfg.apply_ini(
            "[video\n\
             no equals sign here\n\
             plane_id = not-a-number\n\
             udp_port = 9000\n\
             gst_log = maybe\n",
        );
        assert_eq!(cfg.plane_id, 76);
        assert_eq!(cfg.udp_port, 9000);
        assert!(!cfg.gst_log);
    }

    #[test]
    fn ini_round_trip() {
        let mut cfg = AppCfg::default();
        cfg.connector = Some("DSI-1".to_owned());
        cfg.udp_port = 5700;
        cfg.vid_pt = -1;
        cfg.gst_log = true;
        cfg.record.enable = true;
        cfg.record.output_path = PathBuf::from("/tmp/rt.mp4");
        cfg.record.mode = RecordMode::Standard;

        let mut loaded = AppCfg::default();
        loaded.apply_ini(&cfg.to_ini_string());
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn validate_rejects_zero_appsink_buffers() {
        let cfg = AppCfg {
            appsink_max_buffers: 0,
            ..AppCfg::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_out_of_range_payload_type() {
        let cfg = AppCfg {
            vid_pt: 128,
            ..AppCfg::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Config(_))));
        let wildcard = AppCfg {
            vid_pt: -1,
            ..AppCfg::default()
        };
        assert!(wildcard.validate().is_ok());
    }
}
