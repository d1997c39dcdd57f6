//! Configuration module
//!
//! Everything the pipeline needs to know up front lives in one
//! [`CaptureConfig`] value, built once at startup and passed into the
//! constructors that need it. There is no process-wide default state.
//!
//! # Config Location
//!
//! [`CaptureConfig::load_or_default`] looks for a TOML file in the
//! platform configuration directory:
//! - **Linux**: `~/.config/timetag-capture/config.toml`
//! - **macOS**: `~/Library/Application Support/timetag-capture/config.toml`
//!
//! The file is only ever read. Every section and field is optional.
//!
//! # Example
//!
//! ```toml
//! [control]
//! backend = "stream"
//! socket_path = "/tmp/timetag.sock"
//!
//! [binner]
//! bin_time = 0.001
//!
//! [binner.layout]
//! kind = "tagged"
//!
//! [buffer]
//! points = 5000
//! ```

pub mod settings;

pub use settings::*;

use crate::binner::{BinnerLaunch, RecordLayout};
use crate::error::{CaptureError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "timetag-capture";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default ring buffer length in bins
pub const DEFAULT_BUFFER_POINTS: usize = 1000;

/// Largest ring buffer length accepted from configuration
pub const MAX_BUFFER_POINTS: usize = 10_000_000;

/// Get the path of the user config file
pub fn config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub control: ControlConfig,
    pub binner: BinnerConfig,
    pub buffer: BufferConfig,
    pub consumers: ConsumerSettings,
    pub simulator: SimulatorConfig,
    pub logging: LoggingConfig,
}

impl CaptureConfig {
    /// Parse a config from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load the user config, falling back to defaults when absent or invalid
    pub fn load_or_default() -> Self {
        let Some(path) = config_path() else {
            return Self::default();
        };
        if !path.exists() {
            tracing::info!("No config at {:?}, using defaults", path);
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}", e);
                Self::default()
            }
        }
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.buffer.points == 0 {
            return Err(CaptureError::Config("buffer.points must be at least 1".into()));
        }
        if self.buffer.points > MAX_BUFFER_POINTS {
            return Err(CaptureError::Config(format!(
                "buffer.points must be at most {}",
                MAX_BUFFER_POINTS
            )));
        }
        if !(self.binner.bin_time.is_finite() && self.binner.bin_time > 0.0) {
            return Err(CaptureError::Config("binner.bin_time must be positive".into()));
        }
        if self.control.connect_attempts == 0 {
            return Err(CaptureError::Config(
                "control.connect_attempts must be at least 1".into(),
            ));
        }
        if self.simulator.clockrate == 0 {
            return Err(CaptureError::Config("simulator.clockrate must be non-zero".into()));
        }
        self.consumers.validate()
    }
}

/// Which control-protocol backend talks to the acquisition peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlBackend {
    /// Newline-framed commands over a Unix stream socket
    #[default]
    Stream,
    /// One command per message over a Unix seqpacket socket
    Message,
    /// In-process software stand-in for the hardware
    Simulated,
}

impl std::fmt::Display for ControlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlBackend::Stream => write!(f, "stream"),
            ControlBackend::Message => write!(f, "message"),
            ControlBackend::Simulated => write!(f, "simulated"),
        }
    }
}

/// Control connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub backend: ControlBackend,

    /// Control socket of the acquisition peer
    pub socket_path: PathBuf,

    /// Connection attempts before giving up
    pub connect_attempts: u32,

    /// Delay between connection attempts in milliseconds
    pub connect_delay_ms: u64,

    /// Acquisition executable to spawn with `socket_path` as its argument
    pub peer_program: Option<PathBuf>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            backend: ControlBackend::Stream,
            socket_path: PathBuf::from("/tmp/timetag.sock"),
            connect_attempts: 10,
            connect_delay_ms: 200,
            peer_program: None,
        }
    }
}

impl ControlConfig {
    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }
}

/// Capture binner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinnerConfig {
    /// Directory holding the native acquisition and binning tools
    pub tools_dir: PathBuf,

    /// Binning executable, resolved against `tools_dir` when relative
    pub program: PathBuf,

    /// Record layout the binner emits
    pub layout: RecordLayout,

    /// Bin duration in seconds
    pub bin_time: f64,
}

impl Default for BinnerConfig {
    fn default() -> Self {
        Self {
            tools_dir: PathBuf::from("/usr/bin"),
            program: PathBuf::from("timetag_bin"),
            layout: RecordLayout::Tagged,
            bin_time: 1e-3,
        }
    }
}

impl BinnerConfig {
    /// Absolute path of the binning executable
    pub fn program_path(&self) -> PathBuf {
        if self.program.is_absolute() {
            self.program.clone()
        } else {
            self.tools_dir.join(&self.program)
        }
    }

    /// Launch description for a binner with the given bin time
    pub fn launch(&self, bin_time: f64, clockrate: u64) -> BinnerLaunch {
        BinnerLaunch::Process {
            program: self.program_path(),
            args: vec![bin_length(bin_time, clockrate).to_string()],
        }
    }
}

/// Bin length in clock ticks for a bin time in seconds
pub fn bin_length(bin_time: f64, clockrate: u64) -> u64 {
    ((bin_time * clockrate as f64) as u64).max(1)
}

/// Ring buffer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bins kept per channel
    pub points: usize,

    /// Output flow-control window sent to the peer after start
    pub send_window: Option<u32>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            points: DEFAULT_BUFFER_POINTS,
            send_window: None,
        }
    }
}

/// Software stand-in settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Simulated clock rate in Hz
    pub clockrate: u64,

    /// Reported hardware version
    pub hw_version: String,

    /// Mean photon rate per channel in Hz; the index is the channel id
    pub count_rates: Vec<f64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            clockrate: 32_000_000,
            hw_version: "1".to_string(),
            count_rates: vec![100.0, 80.0, 0.0, 0.0],
        }
    }
}

/// Logging settings for the binary
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also write logs to this file
    pub file: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = CaptureConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer.points, 1000);
        assert_eq!(config.control.backend, ControlBackend::Stream);
        assert_eq!(
            config.binner.program_path(),
            PathBuf::from("/usr/bin/timetag_bin")
        );
    }

    #[test]
    fn test_partial_toml() {
        let config = CaptureConfig::from_toml(
            r#"
            [control]
            backend = "message"
            socket_path = "/run/tagger.sock"

            [binner]
            bin_time = 0.01

            [binner.layout]
            kind = "per_channel"
            channel = 2

            [consumers.histogram]
            width = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.control.backend, ControlBackend::Message);
        assert_eq!(config.control.socket_path, PathBuf::from("/run/tagger.sock"));
        assert_eq!(config.control.connect_attempts, 10);
        assert_eq!(config.binner.layout, RecordLayout::PerChannel { channel: 2 });
        assert_eq!(config.consumers.histogram.width, 5);
        assert_eq!(config.buffer.points, DEFAULT_BUFFER_POINTS);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = CaptureConfig::from_toml("[buffer]\npoints = 0\n").unwrap_err();
        assert!(matches!(err, CaptureError::Config(_)));
        assert!(CaptureConfig::from_toml("[binner]\nbin_time = -1.0\n").is_err());
        assert!(CaptureConfig::from_toml("not toml [").is_err());
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let err = CaptureConfig::from_toml("[buffer]\npoints = 4611686018427387903\n").unwrap_err();
        assert!(matches!(err, CaptureError::Config(_)));
        let at_limit = format!("[buffer]\npoints = {}\n", MAX_BUFFER_POINTS);
        assert!(CaptureConfig::from_toml(&at_limit).is_ok());

        let err = CaptureConfig::from_toml("[consumers]\npoll_period_secs = inf\n").unwrap_err();
        assert!(matches!(err, CaptureError::Config(_)));
        assert!(CaptureConfig::from_toml("[consumers]\npoll_period_secs = nan\n").is_err());
        assert!(CaptureConfig::from_toml("[consumers.fret]\nwidth = -0.1\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[simulator]\nclockrate = 30000000").unwrap();
        let config = CaptureConfig::load(file.path()).unwrap();
        assert_eq!(config.simulator.clockrate, 30_000_000);
    }

    #[test]
    fn test_bin_length_and_launch() {
        assert_eq!(bin_length(1e-3, 30_000_000), 30_000);
        assert_eq!(bin_length(0.0, 30_000_000), 1);
        let config = BinnerConfig {
            program: PathBuf::from("/opt/tt/timetag_bin"),
            ..Default::default()
        };
        match config.launch(1e-2, 32_000_000) {
            BinnerLaunch::Process { program, args } => {
                assert_eq!(program, PathBuf::from("/opt/tt/timetag_bin"));
                assert_eq!(args, vec!["320000".to_string()]);
            }
            other => panic!("unexpected launch {:?}", other),
        }
    }
}
