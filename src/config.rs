use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::awg::ConnectionConfig;
use crate::error::ScanError;
use crate::pulse::{ClipPolicy, PulseTiming};
use crate::sweep::SweepSpec;

/// Searched in order when no config path is given
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["qm_scan.toml", "config.toml"];

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub awg: AwgConfig,
    pub counter: CounterConfig,
    pub scan: ScanConfig,
    pub pulse: PulseTiming,
    pub sweep: SweepSpec,
    pub output: OutputConfig,
    pub console: ConsoleConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct AwgConfig {
    /// `TCPIP0::<host>::<port>::SOCKET` or `<host>:<port>`
    pub resource: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Waveform list entry receiving the control channel
    pub control_waveform: String,
    /// Waveform list entry receiving the signal channel
    pub signal_waveform: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CounterConfig {
    pub settings_file: PathBuf,
    pub integration_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ScanConfig {
    pub settle_ms: u64,
    pub clip_policy: ClipPolicy,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub enabled: bool,
    pub output_path: String,
    /// Rewrite the JSONL log as a JSON array when the sweep ends
    pub finalize_as_json: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for AwgConfig {
    fn default() -> Self {
        Self {
            resource: "TCPIP0::141.20.45.148::4000::SOCKET".to_string(),
            connect_timeout_ms: 5000,
            read_timeout_ms: 10000,
            write_timeout_ms: 10000,
            control_waveform: "control_pulse".to_string(),
            signal_waveform: "signal_pulse".to_string(),
        }
    }
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            settings_file: PathBuf::from("multiharp.toml"),
            integration_ms: 1000,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            settle_ms: 2000,
            clip_policy: ClipPolicy::Clamp,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_path: "./experiments".to_string(),
            finalize_as_json: false,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

impl AwgConfig {
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

impl CounterConfig {
    pub fn integration(&self) -> Duration {
        Duration::from_millis(self.integration_ms)
    }
}

impl ScanConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ScanError> {
        crate::awg::validate_resource(&self.awg.resource)?;
        if self.awg.control_waveform.is_empty() || self.awg.signal_waveform.is_empty() {
            return Err(ScanError::Configuration(
                "awg waveform slot names must not be empty".to_string(),
            ));
        }
        if self.awg.control_waveform == self.awg.signal_waveform {
            return Err(ScanError::Configuration(format!(
                "control and signal channels share the waveform slot {:?}",
                self.awg.control_waveform
            )));
        }
        if self.awg.read_timeout_ms == 0 || self.awg.write_timeout_ms == 0 {
            return Err(ScanError::Configuration(
                "awg timeouts must be greater than zero".to_string(),
            ));
        }

        // MHLib accepts 1 ms to 100 h
        if !(1..=360_000_000).contains(&self.counter.integration_ms) {
            return Err(ScanError::Configuration(format!(
                "counter.integration_ms out of range: {}",
                self.counter.integration_ms
            )));
        }

        self.pulse
            .validate()
            .map_err(|e| ScanError::Configuration(format!("pulse: {e}")))?;
        self.sweep
            .validate()
            .map_err(|e| ScanError::Configuration(format!("sweep: {e}")))?;

        if self.console.verbosity.parse::<log::LevelFilter>().is_err() {
            return Err(ScanError::Configuration(format!(
                "unknown console.verbosity {:?}",
                self.console.verbosity
            )));
        }
        Ok(())
    }
}

/// Load configuration from file with layered fallbacks.
///
/// Serde defaults, then the file (explicit path, or the first of `qm_scan.toml` /
/// `config.toml` that exists), then `QM_SCAN__<SECTION>__<KEY>` environment variables.
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ScanError> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ScanError::Configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(File::from(path));
    } else if let Some(path) = DEFAULT_CONFIG_PATHS
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
    {
        log::info!("Using config file {}", path.display());
        builder = builder.add_source(File::from(path));
    }

    builder = builder.add_source(
        Environment::with_prefix("QM_SCAN")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let app_config = builder.build()?.try_deserialize::<AppConfig>()?;
    app_config.validate()?;
    Ok(app_config)
}

/// Like [`load_config`], but falls back to defaults when no config file was named and
/// none of the default locations can be loaded. An explicitly named file must load.
pub fn load_config_or_default(config_path: Option<&Path>) -> Result<AppConfig, ScanError> {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            Ok(config)
        }
        Err(e) if config_path.is_some() => Err(e),
        Err(e) => {
            log::warn!("Using default configuration ({e})");
            Ok(AppConfig::default())
        }
    }
}
