pub mod awg;
pub mod config;
pub mod counter;
pub mod error;
pub mod interface;
pub mod logger;
pub mod plotting;
pub mod pulse;
pub mod result;
pub mod sequencer;
pub mod sweep;

pub use awg::{Awg, ConnectionConfig, ScpiLink, ScpiTransport, TcpScpiTransport};
pub use config::{load_config, load_config_or_default, AppConfig};
pub use counter::{MultiHarp, MultiHarpSettings};
pub use error::ScanError;
pub use interface::{DeviceWarning, Histogram, HistogramCounter, PulseGenerator};
pub use logger::Logger;
pub use plotting::{plot_histogram, plot_waveforms};
pub use pulse::{
    gaussian, lorentzian, super_gaussian, ClipPolicy, PulseSequence, PulseSynthesizer,
    PulseTiming, ReferencePulse, ScanPulse, Waveform,
};
pub use result::{MeasurementKind, ResultStore, ScanResult};
pub use sequencer::ScanSequencer;
pub use sweep::{
    SweepController, SweepEvent, SweepHandle, SweepPoint, SweepRange, SweepSpec, SweepSummary,
};
