mod app;

use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

use app::QmScanApp;

/// Desktop front end for the quantum memory pulse scanner
#[derive(Parser, Debug)]
#[command(name = "qm-scan-gui")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = qm_scan::load_config_or_default(args.config.as_deref())?;

    let level = config
        .console
        .verbosity
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);
    let log_receiver = app::init_logging(level);

    let options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_inner_size([1100.0, 750.0])
            .with_min_inner_size([800.0, 500.0]),
        ..Default::default()
    };

    eframe::run_native(
        "QM Scan",
        options,
        Box::new(move |cc| {
            let mut app = QmScanApp::new(cc, config);
            app.set_log_receiver(log_receiver);
            Ok(Box::new(app))
        }),
    )?;
    Ok(())
}
