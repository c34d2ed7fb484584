use crossbeam_channel::{unbounded, Receiver, Sender};
use eframe::egui;
use egui_plot::{Legend, Line, Plot, PlotPoints};
use log::{error, info, LevelFilter};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use qm_scan::{
    AppConfig, Awg, MultiHarp, MultiHarpSettings, PulseSynthesizer, ResultStore, ScanError,
    ScanSequencer, SweepController, SweepEvent, SweepRange, SweepSpec,
};
use qm_scan::sweep::MAX_SWEEP_POINTS;

type Sequencer = ScanSequencer<Awg, MultiHarp>;

// ============================================================================
// Tee Writer - sends env_logger output to both stderr and GUI channel
// ============================================================================

struct TeeWriter {
    sender: Sender<String>,
    stderr: std::io::Stderr,
}

impl std::io::Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stderr.write_all(buf)?;
        if let Ok(s) = std::str::from_utf8(buf) {
            let trimmed = s.trim_end_matches('\n');
            if !trimmed.is_empty() {
                let _ = self.sender.try_send(trimmed.to_string());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stderr.flush()
    }
}

pub fn init_logging(level: LevelFilter) -> Receiver<String> {
    let (tx, rx) = unbounded();
    let writer = TeeWriter {
        sender: tx,
        stderr: std::io::stderr(),
    };

    env_logger::Builder::new()
        .filter_level(level)
        .filter_module("winit", LevelFilter::Off)
        .filter_module("eframe", LevelFilter::Off)
        .filter_module("egui_glow", LevelFilter::Off)
        .filter_module("wgpu", LevelFilter::Off)
        .filter_module("naga", LevelFilter::Off)
        .filter_module("zbus", LevelFilter::Off)
        .filter_module("tracing", LevelFilter::Off)
        .filter_module("accesskit", LevelFilter::Off)
        .format_timestamp_millis()
        .target(env_logger::Target::Pipe(Box::new(writer)))
        .init();

    rx
}

// ============================================================================
// Run Status
// ============================================================================

#[derive(Debug, Clone)]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Stopped,
    Error(String),
}

// ============================================================================
// Main Application
// ============================================================================

pub struct QmScanApp {
    config: AppConfig,
    spec: SweepSpec,

    // Instruments stay connected between sweeps
    sequencer: Option<Sequencer>,

    // Worker state
    worker: Option<JoinHandle<Option<Sequencer>>>,
    stop_flag: Option<Arc<AtomicBool>>,
    event_receiver: Option<Receiver<SweepEvent>>,
    run_status: RunStatus,
    start_time: Option<Instant>,
    progress: (usize, usize),

    // Results
    results: ResultStore,
    checked: HashSet<String>,

    message: Option<(String, bool)>, // (message, is_error)

    log_messages: Vec<String>,
    log_receiver: Option<Receiver<String>>,
}

impl QmScanApp {
    pub fn new(_cc: &eframe::CreationContext<'_>, config: AppConfig) -> Self {
        Self {
            spec: config.sweep,
            config,
            sequencer: None,
            worker: None,
            stop_flag: None,
            event_receiver: None,
            run_status: RunStatus::Idle,
            start_time: None,
            progress: (0, 0),
            results: ResultStore::new(),
            checked: HashSet::new(),
            message: None,
            log_messages: Vec::new(),
            log_receiver: None,
        }
    }

    pub fn set_log_receiver(&mut self, receiver: Receiver<String>) {
        self.log_receiver = Some(receiver);
    }

    fn is_running(&self) -> bool {
        matches!(self.run_status, RunStatus::Running)
    }

    fn start_sweep(&mut self) {
        let checked = PulseSynthesizer::new(self.config.pulse.clone(), self.config.scan.clip_policy)
            .and_then(|synthesizer| self.spec.check_points(&synthesizer));
        let total = match checked {
            Ok(total) => total,
            Err(e) => {
                self.message = Some((e.to_string(), true));
                return;
            }
        };

        let stop_flag = Arc::new(AtomicBool::new(false));
        self.stop_flag = Some(stop_flag.clone());

        let (event_tx, event_rx) = unbounded();
        self.event_receiver = Some(event_rx);

        let config = self.config.clone();
        let spec = self.spec;
        let sequencer = self.sequencer.take();
        let handle =
            thread::spawn(move || run_sweep_worker(config, sequencer, spec, stop_flag, event_tx));

        self.worker = Some(handle);
        self.run_status = RunStatus::Running;
        self.start_time = Some(Instant::now());
        self.progress = (0, total);
        info!("Sweep started");
        self.message = Some(("Sweep started".to_string(), false));
    }

    fn request_stop(&self) {
        if let Some(flag) = &self.stop_flag {
            flag.store(true, Ordering::SeqCst);
        }
    }

    fn stop_sweep(&mut self) {
        self.request_stop();
        self.message = Some((
            "Stop requested, finishing current measurement...".to_string(),
            false,
        ));
    }

    fn poll_events(&mut self) {
        if let Some(rx) = &self.log_receiver {
            while let Ok(msg) = rx.try_recv() {
                self.log_messages.push(msg);
                if self.log_messages.len() > 1000 {
                    self.log_messages.drain(0..200);
                }
            }
        }

        let Some(rx) = &self.event_receiver else {
            return;
        };
        while let Ok(event) = rx.try_recv() {
            match event {
                SweepEvent::Started { total } => self.progress = (0, total),
                SweepEvent::Result(result) => {
                    self.progress.0 += 1;
                    let name = self.results.insert(result);
                    self.checked.insert(name);
                }
                SweepEvent::Failed { error, .. } => {
                    self.run_status = RunStatus::Error(error.clone());
                    self.message = Some((format!("Sweep failed: {error}"), true));
                }
                SweepEvent::Finished(summary) => {
                    if summary.cancelled {
                        self.run_status = RunStatus::Stopped;
                        self.message = Some((
                            format!(
                                "Stopped after {}/{} measurements",
                                summary.completed, summary.total
                            ),
                            false,
                        ));
                    } else {
                        self.run_status = RunStatus::Completed;
                        self.message = Some(("Sweep completed".to_string(), false));
                    }
                }
            }
        }
    }

    fn check_worker_status(&mut self) {
        self.poll_events();

        let finished = self.worker.as_ref().is_some_and(|h| h.is_finished());
        if !finished {
            return;
        }
        let Some(handle) = self.worker.take() else {
            return;
        };
        self.poll_events();
        self.stop_flag = None;
        self.event_receiver = None;

        match handle.join() {
            Ok(sequencer) => self.sequencer = sequencer,
            Err(_) => {
                error!("Sweep worker panicked");
                self.run_status = RunStatus::Error("worker panicked".to_string());
            }
        }
        if self.is_running() {
            self.run_status = RunStatus::Error("Unexpected termination".to_string());
            self.message = Some(("Sweep terminated unexpectedly".to_string(), true));
        }
    }

    fn status_text(&self) -> &str {
        match &self.run_status {
            RunStatus::Idle => "Ready",
            RunStatus::Running => "Running",
            RunStatus::Completed => "Completed",
            RunStatus::Stopped => "Stopped",
            RunStatus::Error(_) => "Error",
        }
    }

    fn elapsed_text(&self) -> String {
        match self.start_time {
            Some(start) if self.is_running() => format!("{:.0}s", start.elapsed().as_secs()),
            _ => "-".to_string(),
        }
    }

    /// Checked results, or every result when nothing is checked
    fn selection(&self) -> Vec<String> {
        let checked: Vec<String> = self
            .results
            .names()
            .filter(|n| self.checked.contains(*n))
            .map(str::to_string)
            .collect();
        if checked.is_empty() {
            self.results.names().map(str::to_string).collect()
        } else {
            checked
        }
    }

    fn save_results(&mut self, path: &Path) {
        let mut subset = ResultStore::new();
        for name in self.selection() {
            if let Some(result) = self.results.get(&name) {
                subset.insert(result.clone());
            }
        }
        self.message = Some(match subset.save(path) {
            Ok(()) => (format!("Saved {} results", subset.len()), false),
            Err(e) => (format!("Save failed: {e}"), true),
        });
    }

    fn load_results(&mut self, path: &Path) {
        self.message = Some(match self.results.load(path) {
            Ok(names) => {
                let count = names.len();
                self.checked.extend(names);
                (format!("Loaded {count} results"), false)
            }
            Err(e) => (format!("Load failed: {e}"), true),
        });
    }

    /// Write the current config, including the edited sweep ranges, as TOML
    fn save_config(&mut self, path: &Path) {
        let mut config = self.config.clone();
        config.sweep = self.spec;
        self.message = Some(match toml::to_string_pretty(&config) {
            Ok(toml_str) => match std::fs::write(path, toml_str) {
                Ok(()) => (format!("Config saved to {}", path.display()), false),
                Err(e) => (format!("Write failed: {e}"), true),
            },
            Err(e) => (format!("Serialize failed: {e}"), true),
        });
    }

    fn delete_checked(&mut self) {
        let names: Vec<String> = self.checked.drain().collect();
        for name in &names {
            self.results.remove(name);
        }
        self.message = Some((format!("Deleted {} results", names.len()), false));
    }

    fn render_sweep_panel(&mut self, ui: &mut egui::Ui) {
        egui::Frame::group(ui.style()).show(ui, |ui| {
            egui::Grid::new("sweep_grid")
                .num_columns(4)
                .spacing([12.0, 4.0])
                .show(ui, |ui| {
                    ui.label("");
                    ui.label("Min (ns)");
                    ui.label("Max (ns)");
                    ui.label("Steps");
                    ui.end_row();

                    let running = self.is_running();
                    for (label, range) in [
                        ("Write width", &mut self.spec.write_width),
                        ("Signal width", &mut self.spec.signal_width),
                        ("Offset", &mut self.spec.offset),
                    ] {
                        ui.label(label);
                        range_editor(ui, range, !running);
                        ui.end_row();
                    }
                });
            match self.spec.point_count() {
                Some(n) if n <= MAX_SWEEP_POINTS => ui.label(format!("{n} measurements")),
                _ => ui.colored_label(
                    egui::Color32::RED,
                    format!("More than {MAX_SWEEP_POINTS} measurements"),
                ),
            };
        });

        ui.add_space(8.0);

        egui::Frame::group(ui.style()).show(ui, |ui| {
            egui::Grid::new("status_grid")
                .num_columns(2)
                .spacing([20.0, 4.0])
                .show(ui, |ui| {
                    ui.label("Status:");
                    let status_color = match &self.run_status {
                        RunStatus::Running => egui::Color32::YELLOW,
                        RunStatus::Completed => egui::Color32::GREEN,
                        RunStatus::Error(_) => egui::Color32::RED,
                        RunStatus::Idle | RunStatus::Stopped => egui::Color32::GRAY,
                    };
                    ui.colored_label(status_color, self.status_text());
                    ui.end_row();

                    ui.label("Progress:");
                    ui.label(format!("{}/{}", self.progress.0, self.progress.1));
                    ui.end_row();

                    ui.label("Elapsed:");
                    ui.label(self.elapsed_text());
                    ui.end_row();

                    ui.label("AWG:");
                    ui.label(&self.config.awg.resource);
                    ui.end_row();

                    ui.label("Instruments:");
                    ui.label(if self.sequencer.is_some() {
                        "connected"
                    } else {
                        "connect on start"
                    });
                    ui.end_row();
                });
        });

        ui.add_space(8.0);

        if let Some((ref msg, is_error)) = self.message {
            let color = if is_error {
                egui::Color32::RED
            } else {
                egui::Color32::GREEN
            };
            ui.colored_label(color, msg);
            ui.add_space(5.0);
        }

        ui.horizontal(|ui| {
            if ui
                .add_enabled(!self.is_running(), egui::Button::new("Start"))
                .clicked()
            {
                self.message = None;
                self.start_sweep();
            }
            if ui
                .add_enabled(self.is_running(), egui::Button::new("Stop"))
                .clicked()
            {
                self.stop_sweep();
            }
            if ui.button("Save config...").clicked() {
                if let Some(path) = rfd::FileDialog::new()
                    .add_filter("TOML", &["toml"])
                    .save_file()
                {
                    self.save_config(&path);
                }
            }
        });
    }

    fn render_results_panel(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            if ui
                .add_enabled(!self.results.is_empty(), egui::Button::new("Save..."))
                .clicked()
            {
                if let Some(path) = rfd::FileDialog::new()
                    .add_filter("JSON", &["json"])
                    .save_file()
                {
                    self.save_results(&path);
                }
            }
            if ui.button("Load...").clicked() {
                if let Some(path) = rfd::FileDialog::new()
                    .add_filter("JSON", &["json", "jsonl"])
                    .pick_file()
                {
                    self.load_results(&path);
                }
            }
            if ui
                .add_enabled(!self.checked.is_empty(), egui::Button::new("Delete"))
                .clicked()
            {
                self.delete_checked();
            }
        });

        ui.add_space(5.0);
        egui::ScrollArea::vertical()
            .id_salt("results_list")
            .max_height(300.0)
            .show(ui, |ui| {
                let names: Vec<String> = self.results.names().map(str::to_string).collect();
                for name in names {
                    let mut checked = self.checked.contains(&name);
                    if ui.checkbox(&mut checked, &name).changed() {
                        if checked {
                            self.checked.insert(name);
                        } else {
                            self.checked.remove(&name);
                        }
                    }
                }
                if self.results.is_empty() {
                    ui.colored_label(egui::Color32::GRAY, "No results yet");
                }
            });
    }

    fn render_plot(&self, ui: &mut egui::Ui) {
        Plot::new("histogram_plot")
            .height(320.0)
            .legend(Legend::default())
            .x_axis_label("Time (ns)")
            .y_axis_label("Counts")
            .show(ui, |plot_ui| {
                for (name, result) in self.results.iter() {
                    if !self.checked.contains(name) {
                        continue;
                    }
                    let points: PlotPoints = result
                        .bins
                        .iter()
                        .zip(&result.data)
                        .map(|(&t, &c)| [t * 1e-3, f64::from(c)])
                        .collect();
                    plot_ui.line(Line::new(name, points));
                }
            });
    }

    fn render_log(&mut self, ui: &mut egui::Ui) {
        ui.label("Activity Log");
        egui::Frame::group(ui.style()).show(ui, |ui| {
            egui::ScrollArea::vertical()
                .id_salt("activity_log")
                .max_height(160.0)
                .stick_to_bottom(true)
                .show(ui, |ui| {
                    for msg in &self.log_messages {
                        ui.label(egui::RichText::new(msg).monospace().size(11.0));
                    }
                    if self.log_messages.is_empty() {
                        ui.colored_label(egui::Color32::GRAY, "No activity yet");
                    }
                });
        });
        if ui.button("Clear Log").clicked() {
            self.log_messages.clear();
        }
    }
}

fn range_editor(ui: &mut egui::Ui, range: &mut SweepRange, enabled: bool) {
    ui.add_enabled(enabled, egui::DragValue::new(&mut range.min).speed(0.1));
    ui.add_enabled(enabled, egui::DragValue::new(&mut range.max).speed(0.1));
    ui.add_enabled(
        enabled,
        egui::DragValue::new(&mut range.steps).range(1..=1000),
    );
}

fn connect(config: &AppConfig) -> Result<Sequencer, ScanError> {
    info!("Connecting instruments...");
    let synthesizer = PulseSynthesizer::new(config.pulse.clone(), config.scan.clip_policy)?;
    let awg = Awg::connect(&config.awg.resource, config.awg.connection())?
        .with_slots(&config.awg.control_waveform, &config.awg.signal_waveform);
    let settings = MultiHarpSettings::load(&config.counter.settings_file)?;
    let counter = MultiHarp::open(&settings)?;
    info!("MultiHarp {} ready", counter.serial());
    Ok(ScanSequencer::new(synthesizer, awg, counter)
        .with_settle(config.scan.settle())
        .with_integration(config.counter.integration()))
}

/// Worker body: connect if needed, run the sweep, hand the instruments back
fn run_sweep_worker(
    config: AppConfig,
    sequencer: Option<Sequencer>,
    spec: SweepSpec,
    stop_flag: Arc<AtomicBool>,
    event_tx: Sender<SweepEvent>,
) -> Option<Sequencer> {
    let sequencer = match sequencer {
        Some(s) => s,
        None => match connect(&config) {
            Ok(s) => s,
            Err(e) => {
                error!("Instrument setup failed: {e}");
                let _ = event_tx.try_send(SweepEvent::Failed {
                    completed: 0,
                    error: e.to_string(),
                });
                return None;
            }
        },
    };

    let mut controller = SweepController::new(sequencer);
    controller.set_stop_flag(stop_flag);
    controller.set_event_sender(event_tx);
    match controller.run(&spec) {
        Ok(summary) => info!(
            "Sweep worker finished ({}/{} measurements)",
            summary.completed, summary.total
        ),
        Err(e) if e.is_device_error() => {
            // Reconnect on the next start
            error!("Dropping instrument connections after: {e}");
            return None;
        }
        Err(e) => error!("Sweep worker error: {e}"),
    }
    Some(controller.into_sequencer())
}

impl eframe::App for QmScanApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if ctx.input(|i| i.viewport().close_requested()) {
            self.request_stop();
        }
        self.check_worker_status();

        ctx.request_repaint_after(Duration::from_millis(100));

        egui::SidePanel::left("controls")
            .min_width(320.0)
            .show(ctx, |ui| {
                ui.heading("QM Scan");
                ui.add_space(5.0);
                self.render_sweep_panel(ui);
                ui.separator();
                ui.label("Results");
                self.render_results_panel(ui);
            });

        egui::CentralPanel::default().show(ctx, |ui| {
            self.render_plot(ui);
            ui.add_space(10.0);
            self.render_log(ui);
        });
    }
}

impl Drop for QmScanApp {
    /// Stop a running sweep, wait for the worker and release both instruments
    fn drop(&mut self) {
        self.request_stop();
        if let Some(handle) = self.worker.take() {
            info!("Waiting for the sweep worker to finish...");
            match handle.join() {
                Ok(Some(sequencer)) => release_instruments(sequencer),
                Ok(None) => {}
                Err(_) => error!("Sweep worker panicked"),
            }
        }
        if let Some(sequencer) = self.sequencer.take() {
            release_instruments(sequencer);
        }
    }
}

fn release_instruments(sequencer: Sequencer) {
    let (mut awg, mut counter) = sequencer.into_parts();
    if let Err(e) = awg.shutdown() {
        error!("AWG shutdown failed: {e}");
    }
    if let Err(e) = counter.close() {
        error!("MultiHarp close failed: {e}");
    }
    info!("Instruments released");
}
