//! Pulse synthesis for the quantum-memory sequence.
//!
//! Every waveform lives on a fixed sample grid (`PulseTiming::samples` points at
//! `PulseTiming::sample_rate_hz`). Pulse shapes are summed in [0, 1] intensity space and
//! mapped to the AWG's full-scale range with `2x - 1`.
//!
//! A scan sequence carries three lobes:
//! - a flat-topped (super-Gaussian) pump on the control channel,
//! - a write/read control pair separated by the storage time,
//! - a Gaussian signal pulse on the signal channel, a fixed lead after the write pulse.
//!
//! A reference sequence drops the write/read pair and centres a long pump and the signal
//! pulse on the same sample, which is used as the EIT baseline for one signal width.

use crate::error::ScanError;
use log::{debug, warn};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const CLIP_TOLERANCE: f64 = 1e-9;

/// Conversion factor from full width at half maximum to standard deviation
fn fwhm_to_sigma(fwhm: f64) -> f64 {
    fwhm / (2.0 * (2.0 * std::f64::consts::LN_2).sqrt())
}

/// Gaussian with unit peak at `x0`; `fwhm` is the full width at half maximum.
pub fn gaussian(x: f64, x0: f64, fwhm: f64) -> f64 {
    let sigma = fwhm_to_sigma(fwhm);
    (-(x - x0).powi(2) / (2.0 * sigma * sigma)).exp()
}

/// Super-Gaussian of order `order`. The Gaussian exponent is raised to `order`,
/// which flattens the top and steepens the edges. Order 1 is a plain Gaussian.
pub fn super_gaussian(x: f64, x0: f64, fwhm: f64, order: f64) -> f64 {
    let sigma = fwhm_to_sigma(fwhm);
    (-((x - x0).powi(2) / (2.0 * sigma * sigma)).powf(order)).exp()
}

/// Lorentzian with unit peak at `x0` and full width `width`.
pub fn lorentzian(x: f64, x0: f64, width: f64) -> f64 {
    let half = width / 2.0;
    half * half / ((x - x0).powi(2) + half * half)
}

/// What to do when the summed pulse shapes leave the [0, 1] intensity range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClipPolicy {
    /// Clamp to [-1, 1] after normalization and log a warning
    #[default]
    Clamp,
    /// Refuse to produce the waveform
    Reject,
}

/// Fixed timing constants of the pulse sequence. Times are in nanoseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseTiming {
    pub sample_rate_hz: f64,
    pub samples: usize,
    pub pump_width_ns: f64,
    pub pump_center_ns: f64,
    /// Gap between the end of the pump and the write pulse
    pub stage_gap_ns: f64,
    /// Signal pulse delay relative to the write pulse, before any scan offset
    pub signal_lead_ns: f64,
    /// Delay between write and read pulses
    pub storage_ns: f64,
    pub marker_start: usize,
    pub super_gaussian_order: f64,
    /// Reference pump width as a multiple of the signal width
    pub reference_pump_factor: f64,
    /// Leading edge of the reference pump
    pub reference_start_ns: f64,
}

impl Default for PulseTiming {
    fn default() -> Self {
        Self {
            sample_rate_hz: 2.5e9,
            samples: 5000,
            pump_width_ns: 100.0,
            pump_center_ns: 150.0,
            stage_gap_ns: 150.0,
            signal_lead_ns: 27.0,
            storage_ns: 100.0,
            marker_start: 50,
            super_gaussian_order: 5.0,
            reference_pump_factor: 5.0,
            reference_start_ns: 150.0,
        }
    }
}

impl PulseTiming {
    pub fn validate(&self) -> Result<(), ScanError> {
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(ScanError::InvalidParameter(format!(
                "sample rate must be positive, got {}",
                self.sample_rate_hz
            )));
        }
        if self.samples < 2 {
            return Err(ScanError::InvalidParameter(format!(
                "sample count must be at least 2, got {}",
                self.samples
            )));
        }
        if self.marker_start >= self.marker_stop() {
            return Err(ScanError::InvalidParameter(format!(
                "marker window [{}, {}) is empty",
                self.marker_start,
                self.marker_stop()
            )));
        }
        for (name, value) in [
            ("pump_width_ns", self.pump_width_ns),
            ("storage_ns", self.storage_ns),
            ("super_gaussian_order", self.super_gaussian_order),
            ("reference_pump_factor", self.reference_pump_factor),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ScanError::InvalidParameter(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// First sample after the marker window. Half of the record, rounded down.
    pub fn marker_stop(&self) -> usize {
        self.samples / 2
    }

    /// Convert a time in ns to the nearest sample index (ties to even)
    pub fn ns_to_samples(&self, ns: f64) -> f64 {
        (ns * 1e-9 * self.sample_rate_hz).round_ties_even()
    }

    /// Write pulse centre in ns: one pump width and one stage gap after the pump centre
    pub fn write_center_ns(&self) -> f64 {
        self.pump_center_ns + self.pump_width_ns + self.stage_gap_ns
    }

    fn sample_grid(&self) -> Array1<f64> {
        Array1::from_iter((0..self.samples).map(|i| i as f64))
    }
}

/// One named analog channel, samples normalized to [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub name: String,
    pub samples: Array1<f64>,
}

impl Waveform {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples as the little-endian `f32` stream the AWG expects
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&v| v as f32).collect()
    }
}

/// Control and signal waveforms sharing one marker track
#[derive(Debug, Clone, PartialEq)]
pub struct PulseSequence {
    pub control: Waveform,
    pub signal: Waveform,
    /// One entry per sample, 1 inside the marker window
    pub markers: Array1<u8>,
}

impl PulseSequence {
    pub fn sample_count(&self) -> usize {
        self.markers.len()
    }

    /// Marker track packed into AWG marker bytes. Bit 7 is marker 1; bits 6..4 (markers 2-4)
    /// stay clear.
    pub fn marker_bytes(&self) -> Vec<u8> {
        self.markers.iter().map(|&m| (m & 1) << 7).collect()
    }

    /// Write both channels as `<name>.txt` files into `dir`.
    ///
    /// One row per sample: the normalized sample followed by the four marker states.
    pub fn export_csv(&self, dir: &Path) -> Result<(PathBuf, PathBuf), ScanError> {
        std::fs::create_dir_all(dir)?;
        let control_path = dir.join(format!("{}.txt", self.control.name));
        let signal_path = dir.join(format!("{}.txt", self.signal.name));
        self.write_channel(&self.control, &control_path)?;
        self.write_channel(&self.signal, &signal_path)?;
        Ok((control_path, signal_path))
    }

    fn write_channel(&self, waveform: &Waveform, path: &Path) -> Result<(), ScanError> {
        let mut writer = BufWriter::new(File::create(path)?);
        for (sample, marker) in waveform.samples.iter().zip(self.markers.iter()) {
            writeln!(
                writer,
                "{:.6},{m},{m},{m},{m}",
                sample,
                m = marker
            )?;
        }
        writer.flush()?;
        debug!("Exported {} to {}", waveform.name, path.display());
        Ok(())
    }
}

/// Scan sequence plus the sample positions of its lobes
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPulse {
    pub sequence: PulseSequence,
    pub write_center: f64,
    pub read_center: f64,
    pub signal_center: f64,
}

/// Reference sequence plus its common centre
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencePulse {
    pub sequence: PulseSequence,
    pub center_ns: f64,
    pub signal_width_ns: f64,
}

/// Lobe widths and centres of a scan sequence, in samples
struct ScanLayout {
    write_width: f64,
    signal_width: f64,
    write_center: f64,
    read_center: f64,
    signal_center: f64,
}

/// Pure mapping from pulse parameters to sampled waveforms
#[derive(Debug, Clone, Default)]
pub struct PulseSynthesizer {
    timing: PulseTiming,
    clip_policy: ClipPolicy,
}

impl PulseSynthesizer {
    pub fn new(timing: PulseTiming, clip_policy: ClipPolicy) -> Result<Self, ScanError> {
        timing.validate()?;
        Ok(Self {
            timing,
            clip_policy,
        })
    }

    pub fn timing(&self) -> &PulseTiming {
        &self.timing
    }

    /// Build the write/read/signal sequence for one scan point.
    ///
    /// `write_width_ns` and `signal_width_ns` are FWHM values; `offset_ns` shifts the
    /// signal pulse relative to its nominal position after the write pulse.
    pub fn scan_pulse(
        &self,
        write_width_ns: f64,
        signal_width_ns: f64,
        offset_ns: f64,
    ) -> Result<ScanPulse, ScanError> {
        let t = &self.timing;
        let ScanLayout {
            write_width,
            signal_width,
            write_center,
            read_center,
            signal_center,
        } = self.scan_layout(write_width_ns, signal_width_ns, offset_ns)?;
        let pump_width = t.ns_to_samples(t.pump_width_ns);
        let pump_center = t.ns_to_samples(t.pump_center_ns);

        let x = t.sample_grid();
        let order = t.super_gaussian_order;
        let control = x.mapv(|s| {
            super_gaussian(s, pump_center, pump_width, order)
                + gaussian(s, write_center, write_width)
                + gaussian(s, read_center, write_width)
        });
        let signal = x.mapv(|s| gaussian(s, signal_center, signal_width));

        let control_name = format!(
            "control_ch_P{}ns_C{}ns_storage{}ns",
            whole_ns(t.pump_width_ns),
            whole_ns(write_width_ns),
            whole_ns(t.storage_ns)
        );
        let signal_name = format!("signal_ch_S{}ns", whole_ns(signal_width_ns));

        let sequence = PulseSequence {
            control: Waveform {
                samples: self.normalize(control, &control_name)?,
                name: control_name,
            },
            signal: Waveform {
                samples: self.normalize(signal, &signal_name)?,
                name: signal_name,
            },
            markers: self.marker_track(),
        };

        Ok(ScanPulse {
            sequence,
            write_center,
            read_center,
            signal_center,
        })
    }

    /// Build the EIT reference sequence for one signal width.
    ///
    /// The pump is `reference_pump_factor` times wider than the signal and both share one
    /// centre, half a pump width after `reference_start_ns`.
    pub fn reference_pulse(&self, signal_width_ns: f64) -> Result<ReferencePulse, ScanError> {
        let t = &self.timing;
        let (signal_width, pump_width_ns, center_ns) = self.reference_layout(signal_width_ns)?;
        let pump_width = t.ns_to_samples(pump_width_ns);
        let center = t.ns_to_samples(center_ns);

        let x = t.sample_grid();
        let order = t.super_gaussian_order;
        let control = x.mapv(|s| super_gaussian(s, center, pump_width, order));
        let signal = x.mapv(|s| gaussian(s, center, signal_width));

        let control_name = format!("control_ch_P{}ns_ref", whole_ns(pump_width_ns));
        let signal_name = format!("signal_ch_S{}ns", whole_ns(signal_width_ns));

        let sequence = PulseSequence {
            control: Waveform {
                samples: self.normalize(control, &control_name)?,
                name: control_name,
            },
            signal: Waveform {
                samples: self.normalize(signal, &signal_name)?,
                name: signal_name,
            },
            markers: self.marker_track(),
        };

        Ok(ReferencePulse {
            sequence,
            center_ns,
            signal_width_ns,
        })
    }

    /// Check scan parameters without building the waveforms.
    ///
    /// With [`ClipPolicy::Reject`] the sequence is synthesized and discarded, as clipping
    /// is only known from the summed samples.
    pub fn check_scan(
        &self,
        write_width_ns: f64,
        signal_width_ns: f64,
        offset_ns: f64,
    ) -> Result<(), ScanError> {
        match self.clip_policy {
            ClipPolicy::Clamp => self
                .scan_layout(write_width_ns, signal_width_ns, offset_ns)
                .map(|_| ()),
            ClipPolicy::Reject => self
                .scan_pulse(write_width_ns, signal_width_ns, offset_ns)
                .map(|_| ()),
        }
    }

    /// Reference counterpart of [`PulseSynthesizer::check_scan`]
    pub fn check_reference(&self, signal_width_ns: f64) -> Result<(), ScanError> {
        match self.clip_policy {
            ClipPolicy::Clamp => self.reference_layout(signal_width_ns).map(|_| ()),
            ClipPolicy::Reject => self.reference_pulse(signal_width_ns).map(|_| ()),
        }
    }

    fn scan_layout(
        &self,
        write_width_ns: f64,
        signal_width_ns: f64,
        offset_ns: f64,
    ) -> Result<ScanLayout, ScanError> {
        let t = &self.timing;
        let write_width = self.width_in_samples("write width", write_width_ns)?;
        let signal_width = self.width_in_samples("signal width", signal_width_ns)?;
        if !offset_ns.is_finite() {
            return Err(ScanError::InvalidParameter(format!(
                "offset must be finite, got {offset_ns}"
            )));
        }

        let write_center = t.ns_to_samples(t.write_center_ns());
        let read_center = write_center + t.ns_to_samples(t.storage_ns);
        let signal_center =
            t.ns_to_samples(t.write_center_ns() + t.signal_lead_ns + offset_ns);
        self.check_in_window("signal centre", signal_center)?;
        self.check_in_window("read centre", read_center)?;
        Ok(ScanLayout {
            write_width,
            signal_width,
            write_center,
            read_center,
            signal_center,
        })
    }

    /// Signal width in samples, pump width in ns and the shared centre in ns
    fn reference_layout(&self, signal_width_ns: f64) -> Result<(f64, f64, f64), ScanError> {
        let t = &self.timing;
        let signal_width = self.width_in_samples("signal width", signal_width_ns)?;
        let pump_width_ns = t.reference_pump_factor * signal_width_ns;
        let center_ns = t.reference_start_ns + pump_width_ns / 2.0;
        self.check_in_window("reference centre", t.ns_to_samples(center_ns))?;
        Ok((signal_width, pump_width_ns, center_ns))
    }

    /// 1 on `[marker_start, marker_stop)`, 0 elsewhere. Independent of pulse parameters.
    pub fn marker_track(&self) -> Array1<u8> {
        let t = &self.timing;
        let (start, stop) = (t.marker_start, t.marker_stop());
        Array1::from_iter((0..t.samples).map(|i| u8::from(i >= start && i < stop)))
    }

    fn width_in_samples(&self, what: &str, width_ns: f64) -> Result<f64, ScanError> {
        if !(width_ns.is_finite() && width_ns > 0.0) {
            return Err(ScanError::InvalidParameter(format!(
                "{what} must be positive, got {width_ns} ns"
            )));
        }
        let samples = self.timing.ns_to_samples(width_ns);
        if samples < 1.0 {
            return Err(ScanError::InvalidParameter(format!(
                "{what} of {width_ns} ns is shorter than one sample"
            )));
        }
        Ok(samples)
    }

    fn check_in_window(&self, what: &str, sample: f64) -> Result<(), ScanError> {
        if sample < 0.0 || sample >= self.timing.samples as f64 {
            return Err(ScanError::InvalidParameter(format!(
                "{what} at sample {sample} lies outside the {}-sample record",
                self.timing.samples
            )));
        }
        Ok(())
    }

    /// Map [0, 1] intensity to [-1, 1] and apply the clip policy
    fn normalize(&self, intensity: Array1<f64>, name: &str) -> Result<Array1<f64>, ScanError> {
        let scaled = intensity.mapv(|v| 2.0 * v - 1.0);
        let out_of_range = scaled
            .iter()
            .filter(|v| v.abs() > 1.0 + CLIP_TOLERANCE)
            .count();
        if out_of_range == 0 {
            // Lobe tails can still push a peak a few ulps over full scale
            return Ok(scaled.mapv(|v| v.clamp(-1.0, 1.0)));
        }
        match self.clip_policy {
            ClipPolicy::Clamp => {
                warn!("{name}: clamped {out_of_range} samples outside [-1, 1]");
                Ok(scaled.mapv(|v| v.clamp(-1.0, 1.0)))
            }
            ClipPolicy::Reject => Err(ScanError::InvalidParameter(format!(
                "{name}: {out_of_range} samples exceed full scale"
            ))),
        }
    }
}

fn whole_ns(ns: f64) -> i64 {
    ns.round_ties_even() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth() -> PulseSynthesizer {
        PulseSynthesizer::new(PulseTiming::default(), ClipPolicy::Clamp).unwrap()
    }

    #[test]
    fn test_gaussian_peak_and_half_maximum() {
        assert!((gaussian(100.0, 100.0, 20.0) - 1.0).abs() < 1e-12);
        assert!((gaussian(110.0, 100.0, 20.0) - 0.5).abs() < 1e-12);
        assert!((gaussian(90.0, 100.0, 20.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_super_gaussian_is_flatter() {
        assert!((super_gaussian(50.0, 50.0, 40.0, 5.0) - 1.0).abs() < 1e-12);
        // Inside the half width the flat top stays closer to 1
        assert!(super_gaussian(60.0, 50.0, 40.0, 5.0) > gaussian(60.0, 50.0, 40.0));
        // Order 1 reduces to the plain Gaussian
        let a = super_gaussian(63.0, 50.0, 40.0, 1.0);
        let b = gaussian(63.0, 50.0, 40.0);
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn test_lorentzian_half_width() {
        assert!((lorentzian(0.0, 0.0, 10.0) - 1.0).abs() < 1e-12);
        assert!((lorentzian(5.0, 0.0, 10.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_scan_pulse_lengths_and_range() {
        let s = synth();
        for (w, sw, off) in [(10.0, 5.0, 0.0), (30.0, 20.0, -10.0), (2.0, 1.0, 40.0)] {
            let pulse = s.scan_pulse(w, sw, off).unwrap();
            let seq = &pulse.sequence;
            assert_eq!(seq.control.len(), 5000);
            assert_eq!(seq.signal.len(), 5000);
            assert_eq!(seq.sample_count(), 5000);
            assert!(seq.control.samples.iter().all(|v| (-1.0..=1.0).contains(v)));
            assert!(seq.signal.samples.iter().all(|v| (-1.0..=1.0).contains(v)));
        }
    }

    #[test]
    fn test_scan_pulse_positions() {
        let pulse = synth().scan_pulse(10.0, 5.0, 3.0).unwrap();
        // 400 ns write centre at 2.5 GS/s
        assert_eq!(pulse.write_center, 1000.0);
        assert_eq!(pulse.read_center, 1250.0);
        // 400 + 27 + 3 ns
        assert_eq!(pulse.signal_center, 1075.0);
        let signal = &pulse.sequence.signal.samples;
        assert!((signal[1075] - 1.0).abs() < 1e-12);
        assert!((signal[0] + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_marker_window_is_fixed() {
        let s = synth();
        for pulse in [
            s.scan_pulse(10.0, 5.0, 0.0).unwrap().sequence,
            s.scan_pulse(40.0, 12.0, 20.0).unwrap().sequence,
            s.reference_pulse(8.0).unwrap().sequence,
        ] {
            for (i, &m) in pulse.markers.iter().enumerate() {
                let expected = u8::from((50..2500).contains(&i));
                assert_eq!(m, expected, "marker mismatch at sample {i}");
            }
        }
    }

    #[test]
    fn test_marker_bytes_use_bit_seven() {
        let seq = synth().scan_pulse(10.0, 5.0, 0.0).unwrap().sequence;
        let bytes = seq.marker_bytes();
        assert_eq!(bytes.len(), 5000);
        assert_eq!(bytes[49], 0);
        assert_eq!(bytes[50], 0x80);
        assert_eq!(bytes[2499], 0x80);
        assert_eq!(bytes[2500], 0);
    }

    #[test]
    fn test_scan_pulse_is_deterministic() {
        let s = synth();
        let a = s.scan_pulse(12.5, 7.5, 3.0).unwrap();
        let b = s.scan_pulse(12.5, 7.5, 3.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_waveform_names() {
        let pulse = synth().scan_pulse(15.0, 10.0, 0.0).unwrap();
        assert_eq!(
            pulse.sequence.control.name,
            "control_ch_P100ns_C15ns_storage100ns"
        );
        assert_eq!(pulse.sequence.signal.name, "signal_ch_S10ns");
    }

    #[test]
    fn test_rejects_non_positive_widths() {
        let s = synth();
        assert!(matches!(
            s.scan_pulse(0.0, 5.0, 0.0),
            Err(ScanError::InvalidParameter(_))
        ));
        assert!(matches!(
            s.scan_pulse(10.0, -1.0, 0.0),
            Err(ScanError::InvalidParameter(_))
        ));
        assert!(matches!(
            s.scan_pulse(10.0, f64::NAN, 0.0),
            Err(ScanError::InvalidParameter(_))
        ));
        assert!(matches!(
            s.reference_pulse(0.0),
            Err(ScanError::InvalidParameter(_))
        ));
        // 0.1 ns rounds to zero samples
        assert!(s.scan_pulse(0.1, 5.0, 0.0).is_err());
    }

    #[test]
    fn test_rejects_signal_outside_record() {
        let s = synth();
        assert!(s.scan_pulse(10.0, 5.0, 2000.0).is_err());
        assert!(s.scan_pulse(10.0, 5.0, -500.0).is_err());
    }

    #[test]
    fn test_reference_pulse() {
        let r = synth().reference_pulse(8.0).unwrap();
        // pump 40 ns wide, starting at 150 ns
        assert!((r.center_ns - 170.0).abs() < 1e-12);
        assert_eq!(r.signal_width_ns, 8.0);
        let seq = &r.sequence;
        assert_eq!(seq.control.len(), 5000);
        let center = 425; // 170 ns at 2.5 GS/s
        assert!((seq.signal.samples[center] - 1.0).abs() < 1e-12);
        assert!((seq.control.samples[center] - 1.0).abs() < 1e-12);
        assert_eq!(seq.control.name, "control_ch_P40ns_ref");
        assert_eq!(seq.signal.name, "signal_ch_S8ns");
    }

    #[test]
    fn test_overlapping_lobes_clamp_or_reject() {
        // A wide pump with a negative gap puts the write pulse on top of the pump
        let timing = PulseTiming {
            pump_width_ns: 400.0,
            stage_gap_ns: -350.0,
            ..PulseTiming::default()
        };
        let clamp = PulseSynthesizer::new(timing.clone(), ClipPolicy::Clamp).unwrap();
        let pulse = clamp.scan_pulse(20.0, 5.0, 0.0).unwrap();
        assert!(pulse
            .sequence
            .control
            .samples
            .iter()
            .all(|v| (-1.0..=1.0).contains(v)));

        let reject = PulseSynthesizer::new(timing, ClipPolicy::Reject).unwrap();
        assert!(matches!(
            reject.scan_pulse(20.0, 5.0, 0.0),
            Err(ScanError::InvalidParameter(_))
        ));
        assert!(clamp.check_scan(20.0, 5.0, 0.0).is_ok());
        assert!(reject.check_scan(20.0, 5.0, 0.0).is_err());
    }

    #[test]
    fn test_check_matches_synthesis() {
        let s = synth();
        assert!(s.check_scan(10.0, 5.0, 3.0).is_ok());
        assert!(s.check_scan(10.0, 5.0, 5000.0).is_err());
        assert!(s.check_scan(0.0, 5.0, 0.0).is_err());
        assert!(s.check_scan(10.0, 5.0, f64::INFINITY).is_err());
        assert!(s.check_reference(8.0).is_ok());
        assert!(s.check_reference(-8.0).is_err());
        // Reference centre 150 + 2.5 * 2000 ns lands past the 2 us record
        assert!(s.check_reference(2000.0).is_err());
    }

    #[test]
    fn test_export_csv() {
        let dir = std::env::temp_dir().join(format!("qm_scan_pulse_{}", std::process::id()));
        let seq = synth().scan_pulse(15.0, 10.0, 0.0).unwrap().sequence;
        let (control, signal) = seq.export_csv(&dir).unwrap();
        let text = std::fs::read_to_string(&control).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5000);
        assert_eq!(lines[0], "-1.000000,0,0,0,0");
        assert!(lines[60].ends_with(",1,1,1,1"));
        assert!(signal.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_invalid_timing() {
        let timing = PulseTiming {
            marker_start: 4000,
            ..PulseTiming::default()
        };
        assert!(PulseSynthesizer::new(timing, ClipPolicy::Clamp).is_err());
    }
}
