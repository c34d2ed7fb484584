use chrono::Utc;
use clap::{Args as ClapArgs, Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn, LevelFilter};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use qm_scan::sweep::SweepHandle;
use qm_scan::{
    load_config_or_default, plot_histogram, plot_waveforms, AppConfig, Awg, Logger, MultiHarp,
    MultiHarpSettings, PulseSynthesizer, ScanResult, ScanSequencer, SweepEvent, SweepRange,
    SweepSpec,
};

#[cfg(windows)]
use std::ffi::OsString;
#[cfg(windows)]
use std::os::windows::ffi::OsStrExt;

/// Quantum memory write/read pulse scanner
#[derive(Parser, Debug)]
#[command(name = "qm-scan")]
#[command(about = "Sweep AWG pulse parameters and record photon-arrival histograms", long_about = None)]
struct Args {
    /// Path to configuration file (defaults to ./qm_scan.toml or ./config.toml)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full sweep on the instruments
    Sweep(SweepArgs),
    /// Synthesize one pulse pair, plot it and optionally export it as CSV
    Preview(PreviewArgs),
}

#[derive(ClapArgs, Debug)]
struct SweepArgs {
    /// Write/read pulse width range in ns, `min:max:steps` or a single value
    #[arg(long, value_name = "RANGE", value_parser = parse_range, allow_hyphen_values = true)]
    write: Option<SweepRange>,

    /// Signal pulse width range in ns
    #[arg(long, value_name = "RANGE", value_parser = parse_range, allow_hyphen_values = true)]
    signal: Option<SweepRange>,

    /// Signal offset range in ns
    #[arg(long, value_name = "RANGE", value_parser = parse_range, allow_hyphen_values = true)]
    offset: Option<SweepRange>,

    /// Do not print a histogram after each measurement
    #[arg(long)]
    no_plot: bool,

    /// Start without waiting for Enter
    #[arg(short, long)]
    yes: bool,
}

#[derive(ClapArgs, Debug)]
struct PreviewArgs {
    /// Write/read pulse width in ns
    #[arg(long, default_value_t = 20.0)]
    write: f64,

    /// Signal pulse width in ns
    #[arg(long, default_value_t = 10.0)]
    signal: f64,

    /// Signal offset in ns
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    offset: f64,

    /// Preview the EIT reference pulse instead of a scan pulse
    #[arg(long)]
    reference: bool,

    /// Write both channels as CSV into this directory
    #[arg(long, value_name = "DIR")]
    export: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(windows)]
    ensure_console_allocated();

    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref())?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level);

    match args.command {
        Command::Sweep(sweep_args) => {
            log_startup_info(&config, args.config.as_deref());
            run_sweep(&config, sweep_args)
        }
        Command::Preview(preview_args) => run_preview(&config, preview_args),
    }
}

/// Parse `min:max:steps` or a single value
fn parse_range(s: &str) -> Result<SweepRange, String> {
    let parts: Vec<&str> = s.split(':').map(str::trim).collect();
    let number = |p: &str| p.parse::<f64>().map_err(|e| format!("{p:?}: {e}"));
    let range = match parts.as_slice() {
        [value] => SweepRange::single(number(value)?),
        [min, max, steps] => SweepRange::new(
            number(min)?,
            number(max)?,
            steps.parse::<usize>().map_err(|e| format!("{steps:?}: {e}"))?,
        ),
        _ => return Err(format!("expected min:max:steps or a single value, got {s:?}")),
    };
    range.validate("range").map_err(|e| e.to_string())?;
    Ok(range)
}

fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== QM Scan ===");
    match config_path {
        Some(path) => info!("Config file: {}", path.display()),
        None => info!("Config file: defaults"),
    }
    info!("AWG: {}", config.awg.resource);
    info!("Counter settings: {}", config.counter.settings_file.display());
    info!(
        "Settle {} ms, integration {} ms, clipping {:?}",
        config.scan.settle_ms, config.counter.integration_ms, config.scan.clip_policy
    );
}

fn log_sweep_spec(spec: &SweepSpec, total: usize) {
    for (axis, range) in [
        ("Write width", spec.write_width),
        ("Signal width", spec.signal_width),
        ("Offset", spec.offset),
    ] {
        info!(
            "{axis}: {:.2} to {:.2} ns, {} steps",
            range.min, range.max, range.steps
        );
    }
    info!("Total measurements: {total}");
}

fn run_sweep(config: &AppConfig, args: SweepArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut spec = config.sweep;
    if let Some(range) = args.write {
        spec.write_width = range;
    }
    if let Some(range) = args.signal {
        spec.signal_width = range;
    }
    if let Some(range) = args.offset {
        spec.offset = range;
    }
    let synthesizer = PulseSynthesizer::new(config.pulse.clone(), config.scan.clip_policy)?;
    let total = spec.check_points(&synthesizer)?;
    log_sweep_spec(&spec, total);

    let awg = Awg::connect(&config.awg.resource, config.awg.connection())?
        .with_slots(&config.awg.control_waveform, &config.awg.signal_waveform);

    let settings = MultiHarpSettings::load(&config.counter.settings_file)?;
    let counter = MultiHarp::open(&settings)?;
    info!("MultiHarp {} ready", counter.serial());

    let sequencer = ScanSequencer::new(synthesizer, awg, counter)
        .with_settle(config.scan.settle())
        .with_integration(config.counter.integration());

    if !args.yes {
        wait_for_user_confirmation()?;
    }

    let mut experiment_log = if config.output.enabled {
        let path = create_log_file_path(&config.output.output_path)?;
        let logger = Logger::new(path, 1, config.output.finalize_as_json);
        info!("Logging results to {}", logger.path().display());
        Some(logger)
    } else {
        None
    };

    let stop_flag = setup_shutdown_handler()?;
    let handle = SweepHandle::spawn_with_flag(sequencer, spec, stop_flag.clone());

    let mut failure = None;
    for event in handle.events().iter() {
        match event {
            SweepEvent::Started { total } => info!("Sweep started, {total} measurements"),
            SweepEvent::Result(result) => {
                report_result(&result, !args.no_plot);
                if let Some(logger) = experiment_log.as_mut() {
                    if let Err(e) = logger.add(result) {
                        error!("Experiment log write failed: {e}");
                    }
                }
            }
            SweepEvent::Failed { completed, error } => {
                error!("✗ Sweep failed after {completed} measurements: {error}");
                failure = Some(error);
            }
            SweepEvent::Finished(summary) => {
                if summary.cancelled {
                    info!(
                        "✓ Sweep stopped by user ({}/{} measurements)",
                        summary.completed, summary.total
                    );
                } else {
                    info!("✓ Sweep completed: {} measurements", summary.completed);
                }
            }
        }
    }

    info!("Cleaning up and shutting down...");
    let sequencer = handle.join()?;
    let (mut awg, mut counter) = sequencer.into_parts();
    if let Err(e) = awg.shutdown() {
        warn!("AWG shutdown failed: {e}");
    }
    if let Err(e) = counter.close() {
        warn!("MultiHarp close failed: {e}");
    }
    if let Some(mut logger) = experiment_log {
        logger.finalize()?;
    }
    info!("Cleanup complete");

    if stop_flag.load(Ordering::SeqCst) {
        info!("Sweep interrupted");
    }
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn report_result(result: &ScanResult, plot: bool) {
    info!(
        "{}: {} counts in {} bins",
        result.display_name(),
        result.total_counts(),
        result.data.len()
    );
    if plot {
        if let Err(e) = plot_histogram(result, None, Some(30)) {
            warn!("Could not plot {}: {e}", result.display_name());
        }
    }
}

fn run_preview(config: &AppConfig, args: PreviewArgs) -> Result<(), Box<dyn std::error::Error>> {
    let synthesizer = PulseSynthesizer::new(config.pulse.clone(), config.scan.clip_policy)?;
    let sequence = if args.reference {
        let pulse = synthesizer.reference_pulse(args.signal)?;
        info!(
            "Reference pump {:.1} ns wide, centred at {:.1} ns",
            args.signal * config.pulse.reference_pump_factor,
            pulse.center_ns
        );
        pulse.sequence
    } else {
        let pulse = synthesizer.scan_pulse(args.write, args.signal, args.offset)?;
        info!(
            "Write centre {:.1}, read centre {:.1}, signal centre {:.1} (samples)",
            pulse.write_center, pulse.read_center, pulse.signal_center
        );
        pulse.sequence
    };

    plot_waveforms(&sequence, config.pulse.sample_rate_hz, None, None)?;

    if let Some(dir) = args.export {
        let (control, signal) = sequence.export_csv(&dir)?;
        info!("Exported {} and {}", control.display(), signal.display());
    }
    Ok(())
}

/// Setup Ctrl+C handler that stops the sweep before its next point
fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current measurement...");
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(stop_flag)
}

fn wait_for_user_confirmation() -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("Press Enter to start the sweep (or Ctrl+C to cancel)...");
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(())
}

fn initialize_logging(log_level: &str) {
    let level = log_level.parse::<LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
        LevelFilter::Info
    });

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn create_log_file_path(log_path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let history_dir = PathBuf::from(log_path);
    fs::create_dir_all(&history_dir)?;

    let filename = format!("qm_scan_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok(history_dir.join(filename))
}

/// Windows-specific: Allocate console if running from GUI
#[cfg(windows)]
fn ensure_console_allocated() {
    unsafe {
        if winapi::um::consoleapi::AllocConsole() != 0 {
            println!("Console allocated for qm-scan");
        }

        let wide_title: Vec<u16> = OsString::from("QM Scan")
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        winapi::um::wincon::SetConsoleTitleW(wide_title.as_ptr());

        // Enable ANSI escape sequences (Windows 10+)
        let stdout_handle =
            winapi::um::processenv::GetStdHandle(winapi::um::winbase::STD_OUTPUT_HANDLE);
        if stdout_handle != winapi::um::handleapi::INVALID_HANDLE_VALUE {
            let mut mode: u32 = 0;
            if winapi::um::consoleapi::GetConsoleMode(stdout_handle, &mut mode) != 0 {
                mode |= winapi::um::wincon::ENABLE_VIRTUAL_TERMINAL_PROCESSING;
                winapi::um::consoleapi::SetConsoleMode(stdout_handle, mode);
            }
        }
    }
}
