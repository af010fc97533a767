//! uwb-positioning command line
//!
//! Runs the relay server, drives simulated tags, and post-processes
//! recorded sessions into positions, segments and accuracy figures.
//!
//! # Usage
//!
//! ```bash
//! uwb-positioning -c deployment.json relay
//! uwb-positioning -c deployment.json simulate --tag-id 1 --x 1.2 --y 2.0 --relay 127.0.0.1:30001
//! uwb-positioning -c deployment.json positions --samples timestamp_ESP32.txt --video frames.txt
//! uwb-positioning accuracy --reference truth.txt --estimated positions.txt
//! ```

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio::runtime::{Builder, Runtime};
use tokio::signal;
use tracing::{error, info, warn};

use uwb_positioning::api::{export_frames, export_segments, AnalysisWindow, ExportOptions, OutputFormat, PositionPipeline};
use uwb_positioning::core::AnchorPosition;
use uwb_positioning::processing::{QuadraticCalibration, SampleStore};
use uwb_positioning::ranging::{Simulation, SimulationError};
use uwb_positioning::relay::{payload_from_report, ClientError, RelayClient, RelayServer};
use uwb_positioning::utils::{init_logging, ConfigurationManager, LogLevel};
use uwb_positioning::validation::{pair_records, parse_coordinates, AccuracyValidator};

/// UWB indoor positioning: relay, simulation and offline analysis
#[derive(Parser, Debug)]
#[command(name = "uwb-positioning")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Deployment configuration file (JSON)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config_file: Option<PathBuf>,

    /// Log level; overrides the configuration file, `RUST_LOG` overrides both
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept tag connections and log their samples in turn
    Relay {
        /// Listen address, overriding the configured one
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
        /// Sample log path, overriding the configured one
        #[arg(long, value_name = "FILE")]
        log: Option<PathBuf>,
    },
    /// Range a simulated tag against the configured anchors
    Simulate {
        #[arg(long)]
        tag_id: u16,
        #[arg(long)]
        x: f64,
        #[arg(long)]
        y: f64,
        /// Number of rounds; runs until interrupted when omitted
        #[arg(long)]
        rounds: Option<u64>,
        /// Relay to submit each round to
        #[arg(long, value_name = "ADDR")]
        relay: Option<String>,
        /// Simulated time allowed for one round (milliseconds)
        #[arg(long, default_value_t = 1_000)]
        budget_ms: u64,
    },
    /// Position every tag at every video frame
    Positions {
        #[command(flatten)]
        recording: Recording,
        #[command(flatten)]
        output: Output,
    },
    /// Split one tag/anchor distance series into stationary segments
    Segments {
        #[command(flatten)]
        recording: Recording,
        #[arg(long)]
        tag_id: u16,
        #[arg(long)]
        anchor_id: u16,
        /// Known distance of each segment, in order; fits a distance calibration
        #[arg(long, value_delimiter = ',', value_name = "METRES")]
        reference: Vec<f64>,
        /// Also write one position per segment
        #[arg(long)]
        positions: bool,
        #[command(flatten)]
        output: Output,
    },
    /// Compare estimated coordinates against reference coordinates
    Accuracy {
        #[arg(long, value_name = "FILE")]
        reference: PathBuf,
        #[arg(long, value_name = "FILE")]
        estimated: PathBuf,
        /// Error radius counted as acceptable (metres)
        #[arg(long, default_value_t = 0.3)]
        tolerance: f64,
    },
}

#[derive(ClapArgs, Debug)]
struct Recording {
    /// Relay sample log
    #[arg(long, value_name = "FILE")]
    samples: PathBuf,
    /// Video frame log (`frameID timestampMs`)
    #[arg(long, value_name = "FILE")]
    video: PathBuf,
    /// Window start, seconds after the first video frame
    #[arg(long, requires = "end")]
    start: Option<f64>,
    /// Window end, seconds after the first video frame
    #[arg(long, requires = "start")]
    end: Option<f64>,
}

#[derive(ClapArgs, Debug)]
struct Output {
    #[arg(long, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    #[arg(long, default_value_t = 4)]
    precision: u8,
    /// Output file; stdout when omitted
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

impl Output {
    fn options(&self) -> ExportOptions {
        ExportOptions {
            format: self.format,
            precision: self.precision,
        }
    }

    fn writer(&self) -> Result<Box<dyn Write>> {
        Ok(match &self.output {
            Some(path) => {
                let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
                Box::new(BufWriter::new(file))
            }
            None => Box::new(BufWriter::new(io::stdout().lock())),
        })
    }
}

fn load_config(path: Option<&Path>) -> Result<ConfigurationManager> {
    match path {
        Some(path) => ConfigurationManager::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(ConfigurationManager::new()),
    }
}

fn runtime() -> Result<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")
}

/// Flag raised by Ctrl+C, for the blocking exports
fn abort_on_ctrl_c() -> Arc<AtomicBool> {
    let abort = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&abort);
    std::thread::spawn(move || {
        let Ok(rt) = Builder::new_current_thread().enable_io().build() else {
            return;
        };
        if rt.block_on(signal::ctrl_c()).is_ok() {
            warn!("Interrupted, stopping after the current record");
            flag.store(true, Ordering::SeqCst);
        }
    });
    abort
}

fn load_pipeline(config: &ConfigurationManager, recording: &Recording) -> Result<(PositionPipeline, Option<AnalysisWindow>)> {
    let store = SampleStore::load(&recording.samples, &recording.video).with_context(|| {
        format!(
            "Failed to load {} and {}",
            recording.samples.display(),
            recording.video.display()
        )
    })?;
    let pipeline = PositionPipeline::from_config(store, config).context("Deployment cannot compute positions")?;
    let window = match (recording.start, recording.end) {
        (Some(start), Some(end)) => {
            let window = pipeline.analysis_window(start, end).context("Invalid analysis window")?;
            info!(
                "Window: frames {}..={}, tags {:?}",
                window.start_frame.frame_id, window.end_frame.frame_id, window.tag_ids
            );
            Some(window)
        }
        _ => None,
    };
    Ok((pipeline, window))
}

fn run_relay(config: &ConfigurationManager, bind: Option<String>, log: Option<PathBuf>) -> Result<()> {
    let mut relay_config = config.relay().clone();
    if let Some(bind) = bind {
        relay_config.bind_address = bind;
    }
    if let Some(log) = log {
        relay_config.sample_log_path = log;
    }

    runtime()?.block_on(async move {
        let server = RelayServer::bind(relay_config).await?;
        info!("Relay listening on {}", server.local_addr()?);
        let stats = server
            .run_until(async {
                if let Err(e) = signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {e}");
                }
                info!("Received Ctrl+C, shutting down...");
            })
            .await;
        info!(
            "Relay stopped: {} samples, {} turns completed, {} lost, {} rejected",
            stats.samples_logged, stats.turns_completed, stats.turns_lost, stats.rejected_payloads
        );
        Ok(())
    })
}

fn run_simulation(
    config: &ConfigurationManager,
    tag_id: u16,
    position: (f64, f64),
    rounds: Option<u64>,
    relay: Option<String>,
    budget_ms: u64,
) -> Result<()> {
    let anchors: Vec<AnchorPosition> = config.anchors().copied().collect();
    if anchors.is_empty() {
        bail!("No anchors configured; pass a deployment file with --config");
    }
    if !config.ranging().tag_ids.contains(tag_id) {
        bail!("Tag id {tag_id} is outside the configured tag range");
    }
    let mut sim = Simulation::new(config.ranging().clone(), tag_id, position, &anchors);

    let Some(relay) = relay else {
        let mut done = 0;
        while rounds.map_or(true, |limit| done < limit) {
            match sim.run_round(budget_ms) {
                Ok(report) => match payload_from_report(&report) {
                    Ok(payload) => println!("{payload}"),
                    Err(e) => warn!("Round skipped: {e}"),
                },
                Err(e @ SimulationError::StartRefused(_)) => return Err(e.into()),
                Err(e) => warn!("Round failed: {e}"),
            }
            done += 1;
        }
        return Ok(());
    };

    runtime()?.block_on(async move {
        let mut served = 0;
        loop {
            let remaining = rounds.map(|limit| limit.saturating_sub(served));
            if remaining == Some(0) {
                return Ok(());
            }
            let mut client = RelayClient::connect(relay.as_str())
                .await
                .with_context(|| format!("Failed to connect to relay {relay}"))?;
            let mut measured = 0;
            let outcome = tokio::select! {
                outcome = client.run(remaining, || {
                    let payload = payload_from_report(&sim.run_round(budget_ms)?)?;
                    measured += 1;
                    Ok::<_, anyhow::Error>(payload)
                }) => outcome,
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, disconnecting");
                    return Ok(());
                }
            };
            match outcome {
                Ok(turns) => served += turns,
                Err(ClientError::RoundAborted { reason }) => {
                    // The relay releases the turn once the connection drops
                    served += measured;
                    warn!("Round aborted ({reason}), reconnecting");
                    tokio::time::sleep(Duration::from_millis(config.ranging().round_sleep_ms)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    })
}

fn run_positions(config: &ConfigurationManager, recording: &Recording, output: &Output) -> Result<()> {
    let (mut pipeline, window) = load_pipeline(config, recording)?;
    let abort = abort_on_ctrl_c();
    let mut writer = output.writer()?;
    let summary = export_frames(&mut pipeline, window.as_ref(), output.options(), &mut writer, &abort)?;
    info!(
        "{} positions written, {} skipped{}",
        summary.records,
        summary.skipped,
        if summary.aborted { " (interrupted)" } else { "" }
    );
    Ok(())
}

fn run_segments(
    config: &ConfigurationManager,
    recording: &Recording,
    tag_id: u16,
    anchor_id: u16,
    reference: &[f64],
    positions: bool,
    output: &Output,
) -> Result<()> {
    let (mut pipeline, window) = load_pipeline(config, recording)?;
    let series = pipeline.distance_series(tag_id, anchor_id, window.as_ref());
    if series.is_empty() {
        bail!("No samples for tag {tag_id} against anchor {anchor_id}");
    }
    let segments = pipeline.segment_frames(&series)?;
    println!("segment start len mean_m frame_id");
    for (index, found) in segments.iter().enumerate() {
        println!(
            "{} {} {} {:.4} {}",
            index, found.segment.start, found.segment.len, found.segment.mean, found.frame.frame_id
        );
    }

    if !reference.is_empty() {
        let measured: Vec<f64> = segments.iter().map(|found| found.segment.mean).collect();
        if measured.len() != reference.len() {
            bail!("{} reference distances given for {} segments", reference.len(), measured.len());
        }
        let calibration = QuadraticCalibration::fit(&measured, reference).context("Calibration fit failed")?;
        let [b0, b1, b2] = calibration.coefficients;
        println!("calibration: d' = {b0:.6} + {b1:.6}*d + {b2:.6}*d^2");
        for (index, (mean, truth)) in measured.iter().zip(reference).enumerate() {
            println!("{} {:.4} -> {:.4} (reference {:.4})", index, mean, calibration.apply(*mean), truth);
        }
    }

    if positions {
        let abort = abort_on_ctrl_c();
        let mut writer = output.writer()?;
        let summary = export_segments(
            &mut pipeline,
            tag_id,
            anchor_id,
            window.as_ref(),
            output.options(),
            &mut writer,
            &abort,
        )?;
        info!("{} segment positions written, {} skipped", summary.records, summary.skipped);
    }
    Ok(())
}

fn run_accuracy(reference: &Path, estimated: &Path, tolerance: f64) -> Result<()> {
    let read = |path: &Path| -> Result<_> {
        let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        parse_coordinates(BufReader::new(file)).with_context(|| format!("Failed to parse {}", path.display()))
    };
    let reference = read(reference)?;
    let estimated = read(estimated)?;
    let pairs = pair_records(&reference, &estimated);
    if pairs.len() < reference.len().max(estimated.len()) {
        warn!(
            "Compared {} pairs out of {} reference and {} estimated records",
            pairs.len(),
            reference.len(),
            estimated.len()
        );
    }

    let mut validator = AccuracyValidator::new();
    validator.add_pairs(&pairs);
    let report = validator.validate_accuracy(tolerance)?;
    let stats = &report.statistics;

    println!("samples: {}", stats.sample_count);
    println!("axis      MAE        MSE        RMSE");
    println!("x    {:10.4} {:10.4} {:10.4}", stats.x.mae, stats.x.mse, stats.x.rmse);
    println!("y    {:10.4} {:10.4} {:10.4}", stats.y.mae, stats.y.mse, stats.y.rmse);
    println!(
        "error: mean {:.4} std {:.4} p95 {:.4} max {:.4}",
        stats.mean_error, stats.std_dev_error, stats.error_95_percentile, stats.max_error
    );
    println!(
        "within {:.2} m: {:.1}%",
        report.tolerance_m,
        report.within_tolerance_rate * 100.0
    );
    for recommendation in &report.recommendations {
        println!("note: {recommendation}");
    }
    Ok(())
}

fn run(args: Args) -> Result<()> {
    let config = load_config(args.config_file.as_deref())?;
    let level = args.log_level.unwrap_or(config.system_config().logging.level);
    init_logging(level);
    match config.config_file_path() {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("No configuration file, using defaults"),
    }
    for warning in config.validate().warnings {
        warn!("{warning}");
    }

    match args.command {
        Command::Relay { bind, log } => run_relay(&config, bind, log),
        Command::Simulate {
            tag_id,
            x,
            y,
            rounds,
            relay,
            budget_ms,
        } => run_simulation(&config, tag_id, (x, y), rounds, relay, budget_ms),
        Command::Positions { recording, output } => run_positions(&config, &recording, &output),
        Command::Segments {
            recording,
            tag_id,
            anchor_id,
            reference,
            positions,
            output,
        } => run_segments(&config, &recording, tag_id, anchor_id, &reference, positions, &output),
        Command::Accuracy {
            reference,
            estimated,
            tolerance,
        } => run_accuracy(&reference, &estimated, tolerance),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
