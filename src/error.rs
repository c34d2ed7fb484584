use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("Device communication error: {0}")]
    DeviceCommunication(String),
    #[error("Connection timeout")]
    Timeout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Sweep worker panicked")]
    WorkerPanicked,
}

impl ScanError {
    /// True for failures on an instrument link, after which the
    /// output state of the instruments can no longer be trusted.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            ScanError::DeviceCommunication(_) | ScanError::Timeout | ScanError::Io(_)
        )
    }
}

impl From<config::ConfigError> for ScanError {
    fn from(e: config::ConfigError) -> Self {
        ScanError::Configuration(e.to_string())
    }
}
