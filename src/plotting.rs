use textplots::{Chart, Plot, Shape};

use crate::error::ScanError;
use crate::pulse::PulseSequence;
use crate::result::ScanResult;

const DEFAULT_WIDTH: usize = 140;
const DEFAULT_HEIGHT: usize = 60;

/// Pick a display unit for a time span given in picoseconds
fn determine_time_scale(max_ps: f64) -> (f64, &'static str) {
    if max_ps >= 1e6 {
        (1e-6, "µs")
    } else if max_ps >= 1e3 {
        (1e-3, "ns")
    } else {
        (1.0, "ps")
    }
}

/// Sum neighbouring bins so at most `max_points` points remain.
///
/// Each output point sits at the start time of its first bin.
fn rebin(bins: &[f64], counts: &[u32], max_points: usize) -> Vec<(f64, f64)> {
    let n = bins.len().min(counts.len());
    if n == 0 {
        return Vec::new();
    }
    let group = n.div_ceil(max_points.max(1));
    (0..n)
        .step_by(group)
        .map(|start| {
            let end = (start + group).min(n);
            let sum: u64 = counts[start..end].iter().map(|&c| u64::from(c)).sum();
            (bins[start], sum as f64)
        })
        .collect()
}

/// Print a terminal chart of one measured histogram
///
/// Long histograms are summed into at most `2 * width` points.
pub fn plot_histogram(
    result: &ScanResult,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), ScanError> {
    if result.bins.is_empty() || result.bins.len() != result.data.len() {
        return Err(ScanError::InvalidParameter(format!(
            "cannot plot {}: {} bins, {} counts",
            result.display_name(),
            result.bins.len(),
            result.data.len()
        )));
    }

    let width = width.unwrap_or(DEFAULT_WIDTH);
    let height = height.unwrap_or(DEFAULT_HEIGHT);
    let points = rebin(&result.bins, &result.data, width * 2);
    let last_ps = points.last().map(|p| p.0).unwrap_or(0.0);
    let (time_scale, time_unit) = determine_time_scale(last_ps);

    let frame: Vec<(f32, f32)> = points
        .iter()
        .map(|&(t, c)| ((t * time_scale) as f32, c as f32))
        .collect();
    let peak = points.iter().fold(0.0_f64, |a, p| a.max(p.1));

    println!("{}", result.display_name());
    println!("X-axis: Time ({time_unit}) | Y-axis: Counts");
    println!(
        "{} bins | {} counts total | peak {:.0}",
        result.bins.len(),
        result.total_counts(),
        peak
    );
    println!("{}", "─".repeat(width));

    let x_max = (last_ps * time_scale).max(f64::EPSILON) as f32;
    Chart::new(width as u32, height as u32, 0.0, x_max)
        .lineplot(&Shape::Lines(&frame))
        .nice();

    println!("Time ({time_unit}) →");
    Ok(())
}

/// Print both channels of a synthesized sequence against time in ns
pub fn plot_waveforms(
    sequence: &PulseSequence,
    sample_rate_hz: f64,
    width: Option<usize>,
    height: Option<usize>,
) -> Result<(), ScanError> {
    if sequence.sample_count() == 0 {
        return Err(ScanError::InvalidParameter("cannot plot an empty sequence".into()));
    }
    if sample_rate_hz.is_nan() || sample_rate_hz <= 0.0 {
        return Err(ScanError::InvalidParameter(format!(
            "sample rate must be positive, got {sample_rate_hz}"
        )));
    }

    let width = width.unwrap_or(DEFAULT_WIDTH);
    let height = height.unwrap_or(DEFAULT_HEIGHT);
    let ns_per_sample = 1e9 / sample_rate_hz;
    let to_frame = |samples: &ndarray::Array1<f64>| -> Vec<(f32, f32)> {
        samples
            .iter()
            .enumerate()
            .map(|(i, &v)| ((i as f64 * ns_per_sample) as f32, v as f32))
            .collect()
    };
    let control = to_frame(&sequence.control.samples);
    let signal = to_frame(&sequence.signal.samples);
    let duration_ns = (sequence.sample_count() - 1) as f64 * ns_per_sample;

    println!("{} / {}", sequence.control.name, sequence.signal.name);
    println!("X-axis: Time (ns) | Y-axis: Amplitude (-1 to 1)");
    println!(
        "{} samples at {:.2} GS/s | {:.1} ns",
        sequence.sample_count(),
        sample_rate_hz / 1e9,
        duration_ns
    );
    println!("{}", "─".repeat(width));

    Chart::new(width as u32, height as u32, 0.0, duration_ns.max(f64::EPSILON) as f32)
        .lineplot(&Shape::Lines(&control))
        .lineplot(&Shape::Lines(&signal))
        .nice();

    println!("Time (ns) →");
    Ok(())
}
