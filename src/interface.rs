use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ScanError;
use crate::pulse::PulseSequence;

/// Entry from an instrument's error queue. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceWarning {
    pub code: i32,
    pub message: String,
}

/// One acquired histogram: `counts[i]` photons in the bin starting at `bins[i]`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Histogram {
    /// Bin start times in picoseconds
    pub bins: Vec<f64>,
    pub counts: Vec<u32>,
}

impl Histogram {
    pub fn new(bins: Vec<f64>, counts: Vec<u32>) -> Result<Self, ScanError> {
        if bins.len() != counts.len() {
            return Err(ScanError::DeviceCommunication(format!(
                "histogram has {} bins but {} counts",
                bins.len(),
                counts.len()
            )));
        }
        Ok(Self { bins, counts })
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total_counts(&self) -> u64 {
        self.counts.iter().map(|&c| u64::from(c)).sum()
    }
}

/// Pulse source driving the control and signal channels
///
/// Implementations own the instrument link. The sequencer only ever calls
/// these methods from the sweep worker thread.
pub trait PulseGenerator: Send {
    /// Upload both channels of `sequence`, route them to outputs 1 and 2, switch every
    /// other output off and start continuous playback.
    ///
    /// Returns the soft errors the instrument reported while programming.
    fn load_and_play(&mut self, sequence: &PulseSequence) -> Result<Vec<DeviceWarning>, ScanError>;

    /// Switch every output off. Called after any failed sweep point.
    fn force_outputs_off(&mut self) -> Result<(), ScanError>;
}

/// Photon-counting histogram instrument
pub trait HistogramCounter: Send {
    /// Block for `integration` and return the histogram collected in that window
    fn acquire_histogram(&mut self, integration: Duration) -> Result<Histogram, ScanError>;
}
