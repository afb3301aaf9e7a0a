// src/main.rs - Operator CLI: start a run, steer it from stdin, print the summary
use clap::{ArgAction, Parser, Subcommand};
use layerstream::config::{self, Config};
use layerstream::hardware::plc::SimulatedPlc;
use layerstream::hardware::simulated::{SimulatedBehavior, SimulatedScannerFactory};
use layerstream::{RunOutcome, RunSummary, SliceFile, StreamOrchestrator};
use layerstream_shared::{FALLBACK_STYLE_TAG, StyleMap, StyleTable};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(
    name = "layerstream",
    about = "Streams sliced layers to a scan controller in step with the machine controller."
)]
struct Cli {
    /// Path to a TOML config file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Print the run summary as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Production run: stream a slice file with the controller handshake
    Run {
        #[arg(long)]
        slice: PathBuf,
        #[arg(long)]
        styles: PathBuf,
        /// Recoat time of the simulated machine controller, ms
        #[arg(long, default_value_t = 200)]
        recoat_ms: u64,
    },
    /// Test run over generated layers with the laser at zero power
    Test {
        #[arg(long, default_value_t = 0.03)]
        thickness: f64,
        #[arg(long, default_value_t = 3)]
        layers: u32,
    },
    /// Validate the config (and optionally a style file), then exit
    CheckConfig {
        #[arg(long)]
        styles: Option<PathBuf>,
    },
}

fn load(path: Option<&Path>) -> Result<Config, BoxError> {
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            Ok(config::load_config(&path.to_string_lossy())?)
        }
        None => {
            tracing::info!("No config file given, using defaults");
            Ok(Config::default())
        }
    }
}

fn load_styles(path: &Path) -> Result<StyleMap, BoxError> {
    let styles = StyleMap::from_file(path)?;
    if styles.lookup(FALLBACK_STYLE_TAG).is_none() {
        return Err(format!("{} has no fallback style (id {})", path.display(), FALLBACK_STYLE_TAG).into());
    }
    Ok(styles)
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<(), BoxError> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!("Run {} ({:?})", summary.run_id, summary.mode);
    println!("  layers:   {}/{}", summary.layers_done, summary.layers_total);
    println!("  commands: {} in {} batches", summary.commands_executed, summary.batches_executed);
    match &summary.outcome {
        RunOutcome::Failed(failure) => println!("  outcome:  failed ({:?}): {}", failure.kind, failure.message),
        outcome => println!("  outcome:  {:?}", outcome),
    }
    Ok(())
}

/// Handles one operator line. Returns the summary if the command ended the run.
fn operator_command(orchestrator: &mut StreamOrchestrator, line: &str) -> Option<RunSummary> {
    match line.trim() {
        "" => None,
        "stop" => {
            // The ticker collects the summary once the current layer is done
            if orchestrator.request_stop() {
                println!("Stopping after the current layer (estop to abort it)");
            }
            None
        }
        "estop" => orchestrator.emergency_stop(),
        "pause" => {
            if let Err(e) = orchestrator.pause() {
                tracing::warn!("Cannot pause: {}", e);
            }
            None
        }
        "resume" => {
            if let Err(e) = orchestrator.resume() {
                tracing::warn!("Cannot resume: {}", e);
            }
            None
        }
        "status" => {
            let (done, total) = orchestrator.progress().unwrap_or((0, 0));
            let queue = orchestrator.queue_stats().unwrap_or_default();
            println!(
                "state {:?}, layers {}/{}, requested {}, produced {}, consumed {}",
                orchestrator.state(),
                done,
                total,
                queue.requested,
                queue.produced,
                queue.consumed
            );
            None
        }
        "prepared" => {
            orchestrator.notify_surface_prepared();
            None
        }
        other => {
            tracing::warn!("Unknown command '{}' (stop, estop, pause, resume, status, prepared)", other);
            None
        }
    }
}

async fn supervise(orchestrator: &mut StreamOrchestrator) -> Result<RunSummary, BoxError> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(Duration::from_millis(50));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted, emergency stop");
                if let Some(summary) = orchestrator.emergency_stop() {
                    return Ok(summary);
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Some(summary) = operator_command(orchestrator, &line) {
                        return Ok(summary);
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    tracing::warn!("Operator input closed: {}", e);
                    stdin_open = false;
                }
            },
            _ = ticker.tick() => {
                if let Some(summary) = orchestrator.poll() {
                    return Ok(summary);
                }
                if orchestrator.run_id().is_none() {
                    return Err("run ended without a summary".into());
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = load(cli.config.as_deref()).map_err(|e| {
        tracing::error!("Failed to load config: {}", e);
        e
    })?;

    if let Commands::CheckConfig { styles } = &cli.command {
        if let Some(path) = styles {
            let styles = load_styles(path)?;
            println!("{}: {} styles", path.display(), styles.len());
        }
        println!(
            "Configuration OK (list capacity {}, flush at {}, handshake timeout {:?})",
            config.scanner.list_capacity,
            config.scanner.flush_threshold(),
            config.handshake.prepared_timeout()
        );
        return Ok(());
    }
    let recoat = match &cli.command {
        Commands::Run { recoat_ms, .. } => Duration::from_millis(*recoat_ms),
        _ => Duration::ZERO,
    };

    let scanner = SimulatedScannerFactory::with_behavior(SimulatedBehavior {
        record_vectors: false,
        ..SimulatedBehavior::default()
    });
    let plc = Arc::new(SimulatedPlc::new(recoat));
    let mut orchestrator = StreamOrchestrator::new(config, Arc::new(scanner), plc)?;

    let json = cli.json;
    orchestrator.on_progress(move |done, total| {
        if !json {
            println!("layer {}/{}", done, total);
        }
    });

    match cli.command {
        Commands::Run { slice, styles, .. } => {
            let styles = load_styles(&styles)?;
            let source = SliceFile::open(&slice)?;
            orchestrator.start(Box::new(source), Arc::new(styles))?;
        }
        Commands::Test { thickness, layers } => {
            orchestrator.start_synthetic(thickness, layers)?;
        }
        Commands::CheckConfig { .. } => return Ok(()),
    }
    tracing::info!("Operator commands: stop, estop, pause, resume, status, prepared");

    let summary = supervise(&mut orchestrator).await?;
    print_summary(&summary, json)?;
    match summary.outcome {
        RunOutcome::Completed | RunOutcome::Stopped => Ok(()),
        RunOutcome::EmergencyStopped | RunOutcome::Failed(_) => std::process::exit(1),
    }
}
