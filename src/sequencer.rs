use log::{debug, error, info, warn};
use std::thread;
use std::time::Duration;

use crate::error::ScanError;
use crate::interface::{DeviceWarning, Histogram, HistogramCounter, PulseGenerator};
use crate::pulse::{PulseSequence, PulseSynthesizer};
use crate::result::ScanResult;

/// Wait after starting playback before counting, so the AWG outputs have settled
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(2000);

/// Default counter integration window
pub const DEFAULT_INTEGRATION: Duration = Duration::from_millis(1000);

/// Runs single measurement points: synthesize, program the AWG, settle, count.
///
/// The sequencer owns both instruments for its whole lifetime. Any instrument failure
/// switches the AWG outputs off before the error is returned.
pub struct ScanSequencer<G: PulseGenerator, C: HistogramCounter> {
    synthesizer: PulseSynthesizer,
    generator: G,
    counter: C,
    settle: Duration,
    integration: Duration,
}

impl<G: PulseGenerator, C: HistogramCounter> ScanSequencer<G, C> {
    pub fn new(synthesizer: PulseSynthesizer, generator: G, counter: C) -> Self {
        Self {
            synthesizer,
            generator,
            counter,
            settle: DEFAULT_SETTLE,
            integration: DEFAULT_INTEGRATION,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_integration(mut self, integration: Duration) -> Self {
        self.integration = integration;
        self
    }

    pub fn synthesizer(&self) -> &PulseSynthesizer {
        &self.synthesizer
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    pub fn integration(&self) -> Duration {
        self.integration
    }

    /// Measure one point of the write-width/offset grid
    pub fn run_scan_point(
        &mut self,
        write_width: f64,
        signal_width: f64,
        offset: f64,
    ) -> Result<ScanResult, ScanError> {
        let pulse = self
            .synthesizer
            .scan_pulse(write_width, signal_width, offset)?;
        info!(
            "Scan point: write {:.2} ns, signal {:.2} ns, offset {:.2} ns",
            write_width, signal_width, offset
        );
        let (histogram, warnings) = self.measure(&pulse.sequence)?;
        Ok(ScanResult::scan(
            write_width,
            signal_width,
            offset,
            histogram,
            warnings,
        ))
    }

    /// Measure the EIT reference for one signal width
    pub fn run_reference_point(&mut self, signal_width: f64) -> Result<ScanResult, ScanError> {
        let pulse = self.synthesizer.reference_pulse(signal_width)?;
        info!(
            "Reference point: signal {:.2} ns, pump centred at {:.1} ns",
            signal_width, pulse.center_ns
        );
        let (histogram, warnings) = self.measure(&pulse.sequence)?;
        Ok(ScanResult::reference(signal_width, histogram, warnings))
    }

    /// Switch the AWG outputs off, logging rather than returning a failure
    pub fn force_outputs_off(&mut self) {
        if let Err(e) = self.generator.force_outputs_off() {
            error!("Failed to switch AWG outputs off: {e}");
        }
    }

    /// Hand the instruments back, e.g. for an explicit shutdown
    pub fn into_parts(self) -> (G, C) {
        (self.generator, self.counter)
    }

    fn measure(
        &mut self,
        sequence: &PulseSequence,
    ) -> Result<(Histogram, Vec<DeviceWarning>), ScanError> {
        let warnings = self
            .generator
            .load_and_play(sequence)
            .inspect_err(|e| warn!("AWG programming failed: {e}"))
            .map_err(|e| self.abort(e))?;

        if !self.settle.is_zero() {
            debug!("Settling for {:?}", self.settle);
            thread::sleep(self.settle);
        }

        let histogram = self
            .counter
            .acquire_histogram(self.integration)
            .inspect_err(|e| warn!("Histogram acquisition failed: {e}"))
            .map_err(|e| self.abort(e))?;
        debug!(
            "Acquired {} bins, {} counts",
            histogram.len(),
            histogram.total_counts()
        );
        Ok((histogram, warnings))
    }

    fn abort(&mut self, e: ScanError) -> ScanError {
        self.force_outputs_off();
        e
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pulse::{ClipPolicy, PulseTiming};
    use parking_lot::Mutex;
    use std::sync::Arc;

    pub(crate) type CallLog = Arc<Mutex<Vec<String>>>;

    /// Generator that records calls and can fail on the n-th upload
    pub(crate) struct MockGenerator {
        pub log: CallLog,
        pub fail_on_load: Option<usize>,
        pub loads: usize,
        pub warnings: Vec<DeviceWarning>,
    }

    impl MockGenerator {
        pub fn new(log: CallLog) -> Self {
            Self {
                log,
                fail_on_load: None,
                loads: 0,
                warnings: Vec::new(),
            }
        }
    }

    impl PulseGenerator for MockGenerator {
        fn load_and_play(
            &mut self,
            sequence: &PulseSequence,
        ) -> Result<Vec<DeviceWarning>, ScanError> {
            self.loads += 1;
            self.log.lock().push(format!("load {}", sequence.control.name));
            if self.fail_on_load == Some(self.loads) {
                return Err(ScanError::DeviceCommunication("upload rejected".into()));
            }
            Ok(self.warnings.clone())
        }

        fn force_outputs_off(&mut self) -> Result<(), ScanError> {
            self.log.lock().push("outputs off".into());
            Ok(())
        }
    }

    /// Counter that returns a fixed small histogram and can fail on the n-th acquisition
    pub(crate) struct MockCounter {
        pub log: CallLog,
        pub fail_on_acquire: Option<usize>,
        pub acquisitions: usize,
    }

    impl MockCounter {
        pub fn new(log: CallLog) -> Self {
            Self {
                log,
                fail_on_acquire: None,
                acquisitions: 0,
            }
        }
    }

    impl HistogramCounter for MockCounter {
        fn acquire_histogram(&mut self, integration: Duration) -> Result<Histogram, ScanError> {
            self.acquisitions += 1;
            self.log
                .lock()
                .push(format!("acquire {}ms", integration.as_millis()));
            if self.fail_on_acquire == Some(self.acquisitions) {
                return Err(ScanError::Timeout);
            }
            let n = self.acquisitions as u32;
            Histogram::new(vec![0.0, 80.0, 160.0], vec![n, 2 * n, 3 * n])
        }
    }

    pub(crate) fn sequencer(
        generator: MockGenerator,
        counter: MockCounter,
    ) -> ScanSequencer<MockGenerator, MockCounter> {
        let synthesizer = PulseSynthesizer::new(PulseTiming::default(), ClipPolicy::Clamp).unwrap();
        ScanSequencer::new(synthesizer, generator, counter)
            .with_settle(Duration::ZERO)
            .with_integration(Duration::from_millis(250))
    }

    #[test]
    fn test_scan_point_order_and_result() {
        let log = CallLog::default();
        let mut seq = sequencer(MockGenerator::new(log.clone()), MockCounter::new(log.clone()));

        let result = seq.run_scan_point(20.0, 10.0, 3.0).unwrap();
        assert_eq!(result.write_width, Some(20.0));
        assert_eq!(result.signal_width, 10.0);
        assert_eq!(result.offset, Some(3.0));
        assert_eq!(result.bins, vec![0.0, 80.0, 160.0]);
        assert_eq!(result.data, vec![1, 2, 3]);
        assert!(!result.is_reference());

        assert_eq!(
            *log.lock(),
            vec![
                "load control_ch_P100ns_C20ns_storage100ns".to_string(),
                "acquire 250ms".to_string(),
            ]
        );
    }

    #[test]
    fn test_reference_point() {
        let log = CallLog::default();
        let mut seq = sequencer(MockGenerator::new(log.clone()), MockCounter::new(log.clone()));

        let result = seq.run_reference_point(8.0).unwrap();
        assert!(result.is_reference());
        assert_eq!(result.write_width, None);
        assert_eq!(result.offset, None);
        assert_eq!(log.lock()[0], "load control_ch_P40ns_ref");
    }

    #[test]
    fn test_invalid_point_touches_no_device() {
        let log = CallLog::default();
        let mut seq = sequencer(MockGenerator::new(log.clone()), MockCounter::new(log.clone()));

        assert!(matches!(
            seq.run_scan_point(-1.0, 10.0, 0.0),
            Err(ScanError::InvalidParameter(_))
        ));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_counter_failure_forces_outputs_off() {
        let log = CallLog::default();
        let mut counter = MockCounter::new(log.clone());
        counter.fail_on_acquire = Some(1);
        let mut seq = sequencer(MockGenerator::new(log.clone()), counter);

        assert!(matches!(
            seq.run_scan_point(20.0, 10.0, 0.0),
            Err(ScanError::Timeout)
        ));
        assert_eq!(log.lock().last().map(String::as_str), Some("outputs off"));
    }

    #[test]
    fn test_generator_failure_skips_acquisition() {
        let log = CallLog::default();
        let mut generator = MockGenerator::new(log.clone());
        generator.fail_on_load = Some(1);
        let mut seq = sequencer(generator, MockCounter::new(log.clone()));

        assert!(seq.run_reference_point(10.0).is_err());
        let calls = log.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], "outputs off");
    }

    #[test]
    fn test_warnings_attached_to_result() {
        let log = CallLog::default();
        let mut generator = MockGenerator::new(log.clone());
        generator.warnings = vec![DeviceWarning {
            code: -222,
            message: "Data out of range".into(),
        }];
        let mut seq = sequencer(generator, MockCounter::new(log));

        let result = seq.run_scan_point(20.0, 10.0, 0.0).unwrap();
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].code, -222);
    }
}
