use crossbeam_channel::{Receiver, Sender};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::ScanError;
use crate::interface::{HistogramCounter, PulseGenerator};
use crate::pulse::PulseSynthesizer;
use crate::result::ScanResult;
use crate::sequencer::ScanSequencer;

/// Upper bound on measurements in one sweep
pub const MAX_SWEEP_POINTS: usize = 100_000;

/// Inclusive linear range of `steps` values from `min` to `max`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRange {
    pub min: f64,
    pub max: f64,
    pub steps: usize,
}

impl SweepRange {
    pub fn new(min: f64, max: f64, steps: usize) -> Self {
        Self { min, max, steps }
    }

    /// A range holding exactly one value
    pub fn single(value: f64) -> Self {
        Self::new(value, value, 1)
    }

    pub fn validate(&self, axis: &str) -> Result<(), ScanError> {
        if self.steps == 0 {
            return Err(ScanError::InvalidParameter(format!(
                "{axis}: steps must be at least 1"
            )));
        }
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(ScanError::InvalidParameter(format!(
                "{axis}: bounds must be finite"
            )));
        }
        Ok(())
    }

    /// Evenly spaced values including both ends. One step yields `[min]`.
    pub fn values(&self) -> Vec<f64> {
        match self.steps {
            0 => Vec::new(),
            1 => vec![self.min],
            n => {
                let step = (self.max - self.min) / (n - 1) as f64;
                (0..n)
                    .map(|i| if i == n - 1 { self.max } else { self.min + step * i as f64 })
                    .collect()
            }
        }
    }
}

/// The three swept axes. Values are in ns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSpec {
    pub write_width: SweepRange,
    pub signal_width: SweepRange,
    pub offset: SweepRange,
}

impl Default for SweepSpec {
    fn default() -> Self {
        Self {
            write_width: SweepRange::new(10.0, 30.0, 3),
            signal_width: SweepRange::single(10.0),
            offset: SweepRange::new(-10.0, 10.0, 5),
        }
    }
}

/// One measurement in the sweep plan
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepPoint {
    Reference {
        signal_width: f64,
    },
    Scan {
        write_width: f64,
        signal_width: f64,
        offset: f64,
    },
}

impl SweepSpec {
    pub fn validate(&self) -> Result<(), ScanError> {
        self.write_width.validate("write_width")?;
        self.signal_width.validate("signal_width")?;
        self.offset.validate("offset")?;
        self.bounded_point_count().map(|_| ())
    }

    /// Total measurements, one reference per signal width included. `None` on overflow.
    pub fn point_count(&self) -> Option<usize> {
        self.write_width
            .steps
            .checked_mul(self.offset.steps)?
            .checked_add(1)?
            .checked_mul(self.signal_width.steps)
    }

    fn bounded_point_count(&self) -> Result<usize, ScanError> {
        match self.point_count() {
            Some(n) if n <= MAX_SWEEP_POINTS => Ok(n),
            _ => Err(ScanError::InvalidParameter(format!(
                "sweep exceeds {MAX_SWEEP_POINTS} measurements"
            ))),
        }
    }

    /// Run every planned point through the synthesizer checks without touching an
    /// instrument. Returns the number of measurements.
    pub fn check_points(&self, synthesizer: &PulseSynthesizer) -> Result<usize, ScanError> {
        self.validate()?;
        for point in self.plan() {
            let checked = match point {
                SweepPoint::Reference { signal_width } => {
                    synthesizer.check_reference(signal_width)
                }
                SweepPoint::Scan {
                    write_width,
                    signal_width,
                    offset,
                } => synthesizer.check_scan(write_width, signal_width, offset),
            };
            if let Err(e) = checked {
                error!("Sweep rejected at {point:?}: {e}");
                return Err(e);
            }
        }
        self.bounded_point_count()
    }

    /// Measurement order: for each signal width its reference first, then the
    /// write-width/offset grid with offset varying fastest.
    pub fn plan(&self) -> impl Iterator<Item = SweepPoint> {
        let writes = self.write_width.values();
        let offsets = self.offset.values();
        self.signal_width
            .values()
            .into_iter()
            .flat_map(move |signal_width| {
                let offsets = offsets.clone();
                let grid = writes.clone().into_iter().flat_map(move |write_width| {
                    offsets.clone().into_iter().map(move |offset| SweepPoint::Scan {
                        write_width,
                        signal_width,
                        offset,
                    })
                });
                std::iter::once(SweepPoint::Reference { signal_width }).chain(grid)
            })
    }
}

/// How a sweep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepSummary {
    pub completed: usize,
    pub total: usize,
    pub cancelled: bool,
}

/// Progress reported by a running sweep
#[derive(Debug, Clone)]
pub enum SweepEvent {
    Started { total: usize },
    Result(ScanResult),
    /// The sweep stopped on an instrument or parameter error
    Failed { completed: usize, error: String },
    Finished(SweepSummary),
}

/// Drives a [`ScanSequencer`] through a [`SweepSpec`].
///
/// Each result is sent to the event channel as soon as it is measured. The stop flag is
/// checked between points only; a point that has started always runs to completion.
pub struct SweepController<G: PulseGenerator, C: HistogramCounter> {
    sequencer: ScanSequencer<G, C>,
    stop_requested: Arc<AtomicBool>,
    event_sender: Option<Sender<SweepEvent>>,
}

impl<G: PulseGenerator, C: HistogramCounter> SweepController<G, C> {
    pub fn new(sequencer: ScanSequencer<G, C>) -> Self {
        Self {
            sequencer,
            stop_requested: Arc::new(AtomicBool::new(false)),
            event_sender: None,
        }
    }

    /// Share a stop flag with another thread (e.g. a Ctrl+C handler)
    pub fn set_stop_flag(&mut self, flag: Arc<AtomicBool>) {
        self.stop_requested = flag;
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop_requested.clone()
    }

    pub fn set_event_sender(&mut self, sender: Sender<SweepEvent>) {
        self.event_sender = Some(sender);
    }

    pub fn sequencer_mut(&mut self) -> &mut ScanSequencer<G, C> {
        &mut self.sequencer
    }

    pub fn into_sequencer(self) -> ScanSequencer<G, C> {
        self.sequencer
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SweepEvent) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.try_send(event);
        }
    }

    /// Run the whole sweep. Results already emitted stay valid if a later point fails.
    pub fn run(&mut self, spec: &SweepSpec) -> Result<SweepSummary, ScanError> {
        let total = match spec.check_points(self.sequencer.synthesizer()) {
            Ok(total) => total,
            Err(e) => {
                self.emit(SweepEvent::Failed {
                    completed: 0,
                    error: e.to_string(),
                });
                return Err(e);
            }
        };
        info!(
            "Starting sweep: {} signal widths x {} write widths x {} offsets, {} measurements",
            spec.signal_width.steps, spec.write_width.steps, spec.offset.steps, total
        );
        self.emit(SweepEvent::Started { total });

        let mut summary = SweepSummary {
            completed: 0,
            total,
            cancelled: false,
        };

        for point in spec.plan() {
            if self.is_stop_requested() {
                info!("Stop requested after {}/{} measurements", summary.completed, total);
                summary.cancelled = true;
                break;
            }

            let measured = match point {
                SweepPoint::Reference { signal_width } => {
                    self.sequencer.run_reference_point(signal_width)
                }
                SweepPoint::Scan {
                    write_width,
                    signal_width,
                    offset,
                } => self
                    .sequencer
                    .run_scan_point(write_width, signal_width, offset),
            };

            match measured {
                Ok(result) => {
                    summary.completed += 1;
                    self.emit(SweepEvent::Result(result));
                }
                Err(e) => {
                    error!("Sweep aborted at {point:?}: {e}");
                    if !e.is_device_error() {
                        // Device errors already switched outputs off in the sequencer
                        self.sequencer.force_outputs_off();
                    }
                    self.emit(SweepEvent::Failed {
                        completed: summary.completed,
                        error: e.to_string(),
                    });
                    return Err(e);
                }
            }
        }

        if !summary.cancelled {
            info!("Sweep finished: {} measurements", summary.completed);
        }
        self.emit(SweepEvent::Finished(summary));
        Ok(summary)
    }
}

/// Handle to a sweep running on its own thread
pub struct SweepHandle<G: PulseGenerator, C: HistogramCounter> {
    events: Receiver<SweepEvent>,
    stop_requested: Arc<AtomicBool>,
    thread: JoinHandle<ScanSequencer<G, C>>,
}

impl<G, C> SweepHandle<G, C>
where
    G: PulseGenerator + 'static,
    C: HistogramCounter + 'static,
{
    /// Start `spec` on a worker thread. The sequencer is returned by [`SweepHandle::join`].
    pub fn spawn(sequencer: ScanSequencer<G, C>, spec: SweepSpec) -> Self {
        Self::spawn_with_flag(sequencer, spec, Arc::new(AtomicBool::new(false)))
    }

    pub fn spawn_with_flag(
        sequencer: ScanSequencer<G, C>,
        spec: SweepSpec,
        stop_requested: Arc<AtomicBool>,
    ) -> Self {
        let (sender, events) = crossbeam_channel::unbounded();
        let mut controller = SweepController::new(sequencer);
        controller.set_stop_flag(stop_requested.clone());
        controller.set_event_sender(sender);

        let thread = thread::spawn(move || {
            if let Err(e) = controller.run(&spec) {
                warn!("Sweep worker exiting after error: {e}");
            }
            controller.into_sequencer()
        });

        Self {
            events,
            stop_requested,
            thread,
        }
    }

    pub fn events(&self) -> &Receiver<SweepEvent> {
        &self.events
    }

    /// Ask the worker to stop before the next point
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> Result<ScanSequencer<G, C>, ScanError> {
        self.thread.join().map_err(|_| ScanError::WorkerPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::tests::{sequencer, CallLog, MockCounter, MockGenerator};
    use std::time::Duration;

    fn controller(
        generator: MockGenerator,
        counter: MockCounter,
    ) -> (SweepController<MockGenerator, MockCounter>, Receiver<SweepEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut c = SweepController::new(sequencer(generator, counter));
        c.set_event_sender(tx);
        (c, rx)
    }

    fn results(rx: &Receiver<SweepEvent>) -> Vec<ScanResult> {
        rx.try_iter()
            .filter_map(|e| match e {
                SweepEvent::Result(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_linspace_values() {
        assert_eq!(SweepRange::new(10.0, 30.0, 3).values(), vec![10.0, 20.0, 30.0]);
        assert_eq!(SweepRange::new(5.0, 50.0, 1).values(), vec![5.0]);
        assert_eq!(SweepRange::new(2.0, -2.0, 5).values(), vec![2.0, 1.0, 0.0, -1.0, -2.0]);
        let v = SweepRange::new(0.0, 1.0, 7).values();
        assert_eq!(v.len(), 7);
        assert_eq!(v[6], 1.0);
    }

    #[test]
    fn test_zero_steps_rejected() {
        let spec = SweepSpec {
            offset: SweepRange::new(0.0, 1.0, 0),
            ..Default::default()
        };
        assert!(matches!(spec.validate(), Err(ScanError::InvalidParameter(_))));

        let log = CallLog::default();
        let (mut c, _rx) = controller(MockGenerator::new(log.clone()), MockCounter::new(log.clone()));
        assert!(c.run(&spec).is_err());
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_out_of_record_offset_rejected_before_any_device_call() {
        let spec = SweepSpec {
            offset: SweepRange::new(0.0, 5000.0, 3),
            ..Default::default()
        };
        let log = CallLog::default();
        let (mut c, rx) = controller(MockGenerator::new(log.clone()), MockCounter::new(log.clone()));

        assert!(matches!(c.run(&spec), Err(ScanError::InvalidParameter(_))));
        assert!(log.lock().is_empty());
        let events: Vec<SweepEvent> = rx.try_iter().collect();
        assert!(matches!(
            events.as_slice(),
            [SweepEvent::Failed { completed: 0, .. }]
        ));
    }

    #[test]
    fn test_oversized_sweep_rejected() {
        let huge = SweepRange::new(0.0, 1.0, 1 << 22);
        let spec = SweepSpec {
            write_width: huge,
            signal_width: huge,
            offset: huge,
        };
        assert_eq!(spec.point_count(), None);
        assert!(matches!(spec.validate(), Err(ScanError::InvalidParameter(_))));

        let spec = SweepSpec {
            write_width: SweepRange::new(10.0, 30.0, 1000),
            signal_width: SweepRange::new(5.0, 10.0, 1000),
            offset: SweepRange::new(-10.0, 10.0, 1000),
        };
        assert_eq!(spec.point_count(), Some(1000 * (1 + 1000 * 1000)));
        assert!(spec.validate().is_err());

        let spec = SweepSpec {
            offset: SweepRange::new(-10.0, 10.0, MAX_SWEEP_POINTS),
            write_width: SweepRange::single(20.0),
            signal_width: SweepRange::single(10.0),
        };
        assert_eq!(spec.point_count(), Some(MAX_SWEEP_POINTS + 1));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_plan_is_lazy() {
        let spec = SweepSpec {
            write_width: SweepRange::new(10.0, 30.0, 300),
            signal_width: SweepRange::new(5.0, 10.0, 300),
            offset: SweepRange::new(-10.0, 10.0, 300),
        };
        let first: Vec<SweepPoint> = spec.plan().take(3).collect();
        assert_eq!(first[0], SweepPoint::Reference { signal_width: 5.0 });
        assert!(matches!(first[2], SweepPoint::Scan { write_width, .. } if write_width == 10.0));
    }

    #[test]
    fn test_plan_order() {
        let spec = SweepSpec {
            write_width: SweepRange::new(10.0, 20.0, 2),
            signal_width: SweepRange::new(5.0, 6.0, 2),
            offset: SweepRange::new(-1.0, 1.0, 2),
        };
        let plan: Vec<SweepPoint> = spec.plan().collect();
        assert_eq!(Some(plan.len()), spec.point_count());
        assert_eq!(plan.len(), 10);
        assert_eq!(plan[0], SweepPoint::Reference { signal_width: 5.0 });
        assert_eq!(
            plan[1],
            SweepPoint::Scan {
                write_width: 10.0,
                signal_width: 5.0,
                offset: -1.0
            }
        );
        assert_eq!(
            plan[2],
            SweepPoint::Scan {
                write_width: 10.0,
                signal_width: 5.0,
                offset: 1.0
            }
        );
        assert_eq!(plan[5], SweepPoint::Reference { signal_width: 6.0 });
    }

    #[test]
    fn test_single_point_sweep() {
        let log = CallLog::default();
        let (mut c, rx) = controller(MockGenerator::new(log.clone()), MockCounter::new(log));
        let spec = SweepSpec {
            write_width: SweepRange::single(20.0),
            signal_width: SweepRange::single(10.0),
            offset: SweepRange::single(0.0),
        };

        let summary = c.run(&spec).unwrap();
        assert_eq!(summary.completed, 2);
        assert!(!summary.cancelled);

        let results = results(&rx);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_reference());
        assert_eq!(results[1].write_width, Some(20.0));
    }

    #[test]
    fn test_results_grouped_by_signal_width() {
        let log = CallLog::default();
        let (mut c, rx) = controller(MockGenerator::new(log.clone()), MockCounter::new(log));
        let spec = SweepSpec {
            write_width: SweepRange::new(10.0, 30.0, 3),
            signal_width: SweepRange::new(8.0, 12.0, 2),
            offset: SweepRange::new(-2.0, 2.0, 3),
        };

        c.run(&spec).unwrap();
        let results = results(&rx);
        assert_eq!(results.len(), 2 * (1 + 3 * 3));
        let references: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_reference())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(references, vec![0, 10]);
        assert!(results[1..10].iter().all(|r| r.signal_width == 8.0));
        assert!(results[11..].iter().all(|r| r.signal_width == 12.0));
    }

    #[test]
    fn test_stop_before_start() {
        let log = CallLog::default();
        let (mut c, rx) = controller(MockGenerator::new(log.clone()), MockCounter::new(log.clone()));
        c.stop_flag().store(true, Ordering::SeqCst);

        let summary = c.run(&SweepSpec::default()).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.completed, 0);
        assert!(log.lock().is_empty());
        assert!(matches!(rx.try_iter().last(), Some(SweepEvent::Finished(_))));
    }

    #[test]
    fn test_failure_keeps_earlier_results() {
        let log = CallLog::default();
        let mut counter = MockCounter::new(log.clone());
        counter.fail_on_acquire = Some(3);
        let (mut c, rx) = controller(MockGenerator::new(log.clone()), counter);

        assert!(c.run(&SweepSpec::default()).is_err());
        let events: Vec<SweepEvent> = rx.try_iter().collect();
        let completed = events
            .iter()
            .filter(|e| matches!(e, SweepEvent::Result(_)))
            .count();
        assert_eq!(completed, 2);
        assert!(matches!(
            events.last(),
            Some(SweepEvent::Failed { completed: 2, .. })
        ));
        assert_eq!(log.lock().last().map(String::as_str), Some("outputs off"));
    }

    #[test]
    fn test_stop_and_join_hands_instruments_back_for_shutdown() {
        let log = CallLog::default();
        let seq = sequencer(MockGenerator::new(log.clone()), MockCounter::new(log.clone()))
            .with_settle(Duration::from_millis(20));
        // Window closed before the worker reached its first point
        let flag = Arc::new(AtomicBool::new(true));
        let handle = SweepHandle::spawn_with_flag(seq, SweepSpec::default(), flag);

        let seq = handle.join().unwrap();
        let (mut generator, _counter) = seq.into_parts();
        generator.force_outputs_off().unwrap();

        assert_eq!(*log.lock(), vec!["outputs off".to_string()]);
    }

    #[test]
    fn test_worker_stops_between_points() {
        let log = CallLog::default();
        let seq = sequencer(MockGenerator::new(log.clone()), MockCounter::new(log.clone()))
            .with_settle(Duration::from_millis(20));
        let flag = Arc::new(AtomicBool::new(false));
        let spec = SweepSpec {
            write_width: SweepRange::new(10.0, 30.0, 3),
            signal_width: SweepRange::single(10.0),
            offset: SweepRange::new(-10.0, 10.0, 50),
        };
        let handle = SweepHandle::spawn_with_flag(seq, spec, flag);

        // Wait for the first result, then stop
        loop {
            match handle.events().recv().unwrap() {
                SweepEvent::Result(_) => break,
                SweepEvent::Started { total } => assert_eq!(total, 151),
                other => panic!("unexpected event {other:?}"),
            }
        }
        handle.stop();

        let mut finished = None;
        for event in handle.events().iter() {
            if let SweepEvent::Finished(summary) = event {
                finished = Some(summary);
            }
        }
        let summary = finished.unwrap();
        assert!(summary.cancelled);
        assert!(summary.completed < summary.total);

        let seq = handle.join().unwrap();
        let (generator, counter) = seq.into_parts();
        assert_eq!(generator.loads, summary.completed);
        assert_eq!(counter.acquisitions, summary.completed);
    }
}
