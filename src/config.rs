//! Capture session configuration.
//!
//! `main` fills a [`Config`] from the command line; library code never parses
//! arguments itself.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{bail, Result};
use regex::Regex;
use serde::Serialize;
use tracing::level_filters::LevelFilter;

use crate::trace::constants::{BASE_PORT, DEFAULT_MAX_PACKET_SIZE};
use crate::trace::packet::{default_portability_kinds, PacketKind};

/// `1,5,10` or `start-count[-interval]`.
static SCREENSHOT_FRAMES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(,\d+)*|\d+-\d+(-\d+)?)$").expect("Invalid screenshot frames regex")
});

/// `hotkey-<key>[-<frames>]` or `frames-<start>-<count>`.
static TRIM_TRIGGER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(hotkey-[A-Za-z0-9]+(-\d+)?|frames-\d+-\d+)$").expect("Invalid trim trigger regex")
});

/// Output verbosity. Also forwarded to the tracer.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    Errors,
    #[default]
    Warnings,
    Full,
    Debug,
}

impl Verbosity {
    pub fn level_filter(self) -> LevelFilter {
        match self {
            Verbosity::Quiet => LevelFilter::OFF,
            Verbosity::Errors => LevelFilter::ERROR,
            Verbosity::Warnings => LevelFilter::WARN,
            Verbosity::Full => LevelFilter::INFO,
            Verbosity::Debug => LevelFilter::DEBUG,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verbosity::Quiet => "quiet",
            Verbosity::Errors => "errors",
            Verbosity::Warnings => "warnings",
            Verbosity::Full => "full",
            Verbosity::Debug => "debug",
        }
    }

    /// Whether a tracer message of `level` (1 = error .. 4 = debug) should be
    /// shown at this verbosity.
    pub fn shows_message(self, level: u32) -> bool {
        level <= self as u32
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Executable to launch (resolved through PATH when it has no slash)
    pub program: String,
    /// Arguments passed to the program
    pub arguments: Vec<String>,
    /// Working directory for the program (inherits ours when unset)
    pub working_dir: Option<PathBuf>,
    /// Trace file to write
    pub output: PathBuf,
    /// Frames the screenshot layer should capture
    pub screenshot_frames: Option<String>,
    /// Image format for screenshots
    pub screenshot_format: Option<String>,
    /// Echo tracer message packets to stdout
    pub print_trace_messages: bool,
    pub verbosity: Verbosity,
    /// Trim trigger forwarded to the tracer
    pub trim_trigger: Option<String>,
    /// Let the tracer track persistently mapped buffers
    pub track_persistent_mappings: bool,
    /// Library to inject with LD_PRELOAD instead of relying on the layer
    pub preload: Option<PathBuf>,
    /// Address the capture listener binds to
    pub bind_address: String,
    /// Port of tracer 0
    pub base_port: u16,
    /// Largest packet frame accepted from a tracer
    pub max_packet_size: u64,
    /// Packet kinds whose offsets go into the portability table
    pub portability_kinds: BTreeSet<PacketKind>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            program: String::new(),
            arguments: Vec::new(),
            working_dir: None,
            output: PathBuf::from("vktrace_out.vktrace"),
            screenshot_frames: None,
            screenshot_format: None,
            print_trace_messages: false,
            verbosity: Verbosity::default(),
            trim_trigger: None,
            track_persistent_mappings: true,
            preload: None,
            bind_address: "127.0.0.1".to_string(),
            base_port: BASE_PORT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            portability_kinds: default_portability_kinds(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            bail!("No program specified to trace");
        }
        if let Some(frames) = &self.screenshot_frames {
            if !SCREENSHOT_FRAMES_RE.is_match(frames) {
                bail!(
                    "Invalid screenshot frames '{}': use a comma separated list (1,5,9) or start-count[-interval]",
                    frames
                );
            }
        }
        if let Some(trigger) = &self.trim_trigger {
            if !TRIM_TRIGGER_RE.is_match(trigger) {
                bail!(
                    "Invalid trim trigger '{}': use hotkey-<key>[-<frames>] or frames-<start>-<count>",
                    trigger
                );
            }
        }
        if let Some(dir) = &self.working_dir {
            if !dir.is_dir() {
                bail!("Working directory '{}' does not exist", dir.display());
            }
        }
        if self.max_packet_size == 0 {
            bail!("Maximum packet size must be non-zero");
        }
        Ok(())
    }

    pub fn screenshots_enabled(&self) -> bool {
        self.screenshot_frames.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(program: &str) -> Config {
        Config {
            program: program.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_program() {
        assert!(Config::default().validate().is_err());
        assert!(config_for("vkcube").validate().is_ok());
    }

    #[test]
    fn test_screenshot_frames_syntax() {
        for ok in ["1", "1,5,10", "10-3", "10-3-2"] {
            let mut config = config_for("vkcube");
            config.screenshot_frames = Some(ok.to_string());
            assert!(config.validate().is_ok(), "{ok} should be accepted");
        }
        for bad in ["", "1,", "a-b", "1-2-3-4", "1, 2"] {
            let mut config = config_for("vkcube");
            config.screenshot_frames = Some(bad.to_string());
            assert!(config.validate().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_trim_trigger_syntax() {
        let mut config = config_for("vkcube");
        config.trim_trigger = Some("hotkey-F12".to_string());
        assert!(config.validate().is_ok());
        config.trim_trigger = Some("frames-100-20".to_string());
        assert!(config.validate().is_ok());
        config.trim_trigger = Some("sometimes".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_verbosity_message_filter() {
        assert!(!Verbosity::Quiet.shows_message(1));
        assert!(Verbosity::Errors.shows_message(1));
        assert!(!Verbosity::Errors.shows_message(2));
        assert!(Verbosity::Debug.shows_message(4));
        assert_eq!(Verbosity::Full.level_filter(), LevelFilter::INFO);
    }
}
