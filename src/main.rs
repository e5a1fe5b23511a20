//! CLI entry point (spec §6 "CLI surface"). Parses arguments into an
//! [`EngineConfig`], wires a real serial [`FrameSource`] and CSV/console
//! sinks, and runs the [`RealtimeScheduler`] to completion or fatal error.

use anyhow::{Context, Result};
use clap::Parser;
use eeg_lateralization::config::{EngineConfigBuilder, PortSelector};
use eeg_lateralization::error::{FatalKind, RunOutcome};
use eeg_lateralization::scheduler::RealtimeScheduler;
use eeg_lateralization::sink::{ConsoleSink, CsvSink, RecordSink};
use eeg_lateralization::source::{FrameSource, SerialPortBackend};
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "eeg-lateralization",
    about = "Real-time two-channel EEG alpha-band lateralization pipeline"
)]
struct Cli {
    /// Serial endpoint (device path or COM port). Omit to auto-detect.
    endpoint: Option<String>,

    /// Stop after this many seconds; omit to run until disconnect or Ctrl-C.
    #[arg(long)]
    duration: Option<f64>,

    /// Path to a configuration file. Reserved: config-file loading is an
    /// external collaborator in this core and is not implemented here.
    #[arg(long)]
    config: Option<String>,

    /// Serial baud rate.
    #[arg(long, default_value_t = 115_200)]
    baud_rate: u32,

    /// Sampling rate in Hz.
    #[arg(long, default_value_t = 250.0)]
    sampling_rate: f64,

    /// Analysis window length in seconds.
    #[arg(long, default_value_t = 2.0)]
    window_size_s: f64,

    /// Fraction of window overlap between consecutive analyses.
    #[arg(long, default_value_t = 0.5)]
    window_overlap: f64,

    /// Disable CSV logging (console-only output).
    #[arg(long)]
    no_csv: bool,

    /// CSV log file path.
    #[arg(long, default_value = "eeg_data_log.csv")]
    csv_path: String,

    /// Compute per-channel features and quality assessment concurrently
    /// via std::thread::scope instead of sequentially (documented
    /// worker-pool extension point; result is identical either way).
    #[arg(long)]
    parallel_feature_quality: bool,
}

fn line_frequency() -> f64 {
    match std::env::var("EEG_LINE_FREQ").ok().as_deref() {
        Some("60") => 60.0,
        _ => 50.0,
    }
}

fn run(cli: Cli) -> Result<RunOutcome> {
    if let Some(path) = &cli.config {
        log::debug!("--config {path} ignored: configuration-file loading is out of scope for this core");
    }

    let line_freq = line_frequency();
    let port = match cli.endpoint {
        Some(name) => PortSelector::Named(name),
        None => PortSelector::Auto,
    };

    let config = EngineConfigBuilder::new()
        .port(port)
        .baud_rate(cli.baud_rate)
        .sampling_rate(cli.sampling_rate)
        .window_size_s(cli.window_size_s)
        .window_overlap(cli.window_overlap)
        .notch_freq(line_freq)
        .build()
        .context("invalid engine configuration")?;

    let source = FrameSource::new(
        SerialPortBackend,
        SerialPortBackend,
        config.serial.clone(),
        config.signal.adc_max,
    );

    let mut sinks: Vec<Box<dyn RecordSink>> = Vec::new();
    if !cli.no_csv && config.logging.enable_csv {
        let path = if cli.csv_path != "eeg_data_log.csv" {
            cli.csv_path.clone()
        } else {
            config.logging.filename.clone()
        };
        match CsvSink::create(&path, config.logging.flush_interval_records) {
            Ok(sink) => sinks.push(Box::new(sink)),
            Err(e) => {
                log::error!("failed to open CSV sink at {path}: {e}");
            }
        }
    }
    sinks.push(Box::new(ConsoleSink::stdout()));

    let mut scheduler = RealtimeScheduler::new(
        source,
        &config.signal,
        config.decision.clone(),
        config.artifact.clone(),
        line_freq,
        sinks,
    )
    .context("failed to construct filter bank")?;

    let deadline = cli.duration.map(Duration::from_secs_f64);
    Ok(scheduler.run(deadline, cli.parallel_feature_quality, &std::thread::sleep))
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli) {
        Ok(RunOutcome::Completed { windows_emitted }) => {
            log::info!("completed cleanly, {windows_emitted} windows emitted");
            ExitCode::from(0)
        }
        Ok(RunOutcome::FatalError { kind, detail }) => {
            log::error!("fatal error ({kind:?}): {detail}");
            ExitCode::from(1)
        }
        Err(err) => {
            log::error!("invalid configuration: {err:#}");
            ExitCode::from(2)
        }
    }
}
