use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ScanError;

#[cfg(windows)]
fn default_library_path() -> PathBuf {
    PathBuf::from("mhlib64.dll")
}

#[cfg(not(windows))]
fn default_library_path() -> PathBuf {
    PathBuf::from("/usr/local/lib64/mh150/mhlib.so")
}

/// Acquisition settings for the MultiHarp, loaded from a TOML settings file.
///
/// Example file:
/// ```toml
/// library_path = "C:/Windows/System32/mhlib64.dll"
/// device_index = 0
/// channel = 1
/// binning = 0
/// offset_ns = 0
/// sync_divider = 1
/// sync_trigger_mv = -70
/// input_trigger_mv = -70
/// histogram_length_code = 6
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiHarpSettings {
    pub library_path: PathBuf,
    pub device_index: i32,
    /// Input channel (1-based) whose histogram is returned
    pub channel: i32,
    /// Bin width is the base resolution times 2^binning
    pub binning: i32,
    pub offset_ns: i32,
    pub sync_divider: i32,
    pub sync_trigger_mv: i32,
    pub input_trigger_mv: i32,
    /// Histogram length is 1024 * 2^code bins
    pub histogram_length_code: i32,
    /// Rising edge when true, falling edge otherwise
    pub rising_edge: bool,
}

impl Default for MultiHarpSettings {
    fn default() -> Self {
        Self {
            library_path: default_library_path(),
            device_index: 0,
            channel: 1,
            binning: 0,
            offset_ns: 0,
            sync_divider: 1,
            sync_trigger_mv: -70,
            input_trigger_mv: -70,
            histogram_length_code: 6,
            rising_edge: false,
        }
    }
}

impl MultiHarpSettings {
    /// Load and validate a settings file. A missing file is an error; no defaults are
    /// substituted for an explicitly named file.
    pub fn load(path: &Path) -> Result<Self, ScanError> {
        if !path.exists() {
            return Err(ScanError::Configuration(format!(
                "counter settings file not found: {}",
                path.display()
            )));
        }
        let settings = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize::<MultiHarpSettings>()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if !(0..=7).contains(&self.device_index) {
            return Err(ScanError::Configuration(format!(
                "device_index must be 0-7, got {}",
                self.device_index
            )));
        }
        if self.channel < 1 {
            return Err(ScanError::Configuration(format!(
                "channel is 1-based, got {}",
                self.channel
            )));
        }
        if !(0..=24).contains(&self.binning) {
            return Err(ScanError::Configuration(format!(
                "binning must be 0-24, got {}",
                self.binning
            )));
        }
        if !(0..=6).contains(&self.histogram_length_code) {
            return Err(ScanError::Configuration(format!(
                "histogram_length_code must be 0-6, got {}",
                self.histogram_length_code
            )));
        }
        if ![1, 2, 4, 8, 16].contains(&self.sync_divider) {
            return Err(ScanError::Configuration(format!(
                "sync_divider must be 1, 2, 4, 8 or 16, got {}",
                self.sync_divider
            )));
        }
        for (name, level) in [
            ("sync_trigger_mv", self.sync_trigger_mv),
            ("input_trigger_mv", self.input_trigger_mv),
        ] {
            if !(-1200..=1200).contains(&level) {
                return Err(ScanError::Configuration(format!(
                    "{name} must be within +/-1200 mV, got {level}"
                )));
            }
        }
        Ok(())
    }

    pub fn histogram_length(&self) -> usize {
        1024 << self.histogram_length_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{}_{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let s = MultiHarpSettings::default();
        assert!(s.validate().is_ok());
        assert_eq!(s.histogram_length(), 65536);
    }

    #[test]
    fn test_missing_file() {
        let result = MultiHarpSettings::load(Path::new("/nonexistent/mh_settings.toml"));
        assert!(matches!(result, Err(ScanError::Configuration(_))));
    }

    #[test]
    fn test_load_partial_file() {
        let path = temp_file(
            "mh_partial.toml",
            "channel = 2\nbinning = 3\nhistogram_length_code = 2\n",
        );
        let s = MultiHarpSettings::load(&path).unwrap();
        assert_eq!(s.channel, 2);
        assert_eq!(s.binning, 3);
        assert_eq!(s.histogram_length(), 4096);
        assert_eq!(s.sync_divider, 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let path = temp_file("mh_invalid.toml", "sync_divider = 3\n");
        assert!(matches!(
            MultiHarpSettings::load(&path),
            Err(ScanError::Configuration(_))
        ));
        let _ = std::fs::remove_file(path);

        let s = MultiHarpSettings {
            channel: 0,
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }
}
