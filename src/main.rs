use anyhow::{bail, Context, Result};
use camrig::backend::mock::{MockCamera, MockEncoder, NullSoundPlayer};
use camrig::{
    CaptureFlags, CaptureOrchestrator, CaptureState, EngineBackends, EngineConfig, FramePool,
    MediaKind, PreviewSurface, SoundBank, SoundCue, UiProxy,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use crossbeam::channel;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "camrig")]
#[command(about = "Capture-device orchestration engine with an actor-based camera pipeline")]
#[command(version)]
#[command(long_about = "Runs the camrig capture engine against the in-process mock hardware: \
opens the camera, starts a preview, and drives one of the scripted capture scenarios through \
the UI proxy. Captured frame metadata and a session summary are written to the output directory.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "camrig.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without running a scenario")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Scenario to run: photo, burst, video, review
    #[arg(long, default_value = "photo", help = "Scripted scenario: photo, burst, video, review")]
    scenario: String,

    /// Override the configured output directory
    #[arg(long, value_name = "DIR", help = "Directory for captures and the session summary")]
    output_dir: Option<String>,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to a file
    #[arg(long, value_name = "FILE", help = "Append logs to the given file")]
    log_file: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    // The appender guard must outlive the run for file logging to flush.
    let _log_guard = init_logging(&args)?;

    info!("Starting camrig v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = match EngineConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Some(dir) = &args.output_dir {
        config.demo.output_dir = dir.clone();
    }

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    config.validate().context("invalid configuration")?;

    run_scenario(&args.scenario, config)
}

#[derive(Serialize)]
struct SessionSummary {
    session_id: String,
    scenario: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    pictures_received: u32,
    final_photo_state: String,
    final_video_state: String,
    backend_calls: Vec<String>,
}

fn run_scenario(scenario: &str, config: EngineConfig) -> Result<()> {
    let output_dir = PathBuf::from(&config.demo.output_dir);
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating output directory {:?}", output_dir))?;

    let started_at = Utc::now();
    let pool = FramePool::new(config.ui.frame_pool_capacity);
    let (camera_backend, camera_ctl) = MockCamera::with_pool(Some(Arc::clone(&pool)));
    let (encoder_backend, _encoder_ctl) = MockEncoder::new();

    let sound_bank = SoundBank::new();
    sound_bank.assign(SoundCue::Shutter, 1);
    sound_bank.assign(SoundCue::BurstLoop, 2);
    sound_bank.assign(SoundCue::RecordStart, 3);
    sound_bank.assign(SoundCue::RecordStop, 4);

    let orchestrator = CaptureOrchestrator::new(
        config.clone(),
        EngineBackends {
            camera: Box::new(camera_backend),
            encoder: Box::new(encoder_backend),
            sounds: Box::new(NullSoundPlayer),
        },
        sound_bank,
        Arc::clone(&pool),
    )?;
    let ui = UiProxy::attach(&orchestrator, &config, scenario == "review")?;

    info!("Opening camera and starting preview");
    if !orchestrator.open_camera(0) {
        bail!("open command dropped; engine has no live message queue");
    }
    if !orchestrator.start_preview(PreviewSurface {
        id: 1,
        size: (1920, 1080),
    }) {
        bail!("preview command dropped; engine has no live message queue");
    }
    thread::sleep(Duration::from_millis(200));

    match scenario {
        "photo" => {
            info!("Scenario: single photo through the UI proxy");
            if !ui.capture_photo() {
                bail!("UI capture command dropped");
            }
            thread::sleep(Duration::from_millis(400));
        }
        "burst" => {
            info!("Scenario: unbounded burst, stopped by closing the handle");
            let handle = orchestrator
                .capture_photo(-1, CaptureFlags::default())
                .context("engine rejected the burst request")?;
            thread::sleep(Duration::from_millis(500));
            handle.close();
            thread::sleep(Duration::from_millis(300));
        }
        "video" => {
            info!("Scenario: record, pause, resume, stop");
            orchestrator.set_media_type(MediaKind::Video);
            thread::sleep(Duration::from_millis(100));
            let handle = orchestrator
                .capture_video((1280, 720))
                .context("engine rejected the recording request")?;
            thread::sleep(Duration::from_millis(600));
            orchestrator.pause_video();
            thread::sleep(Duration::from_millis(200));
            orchestrator.resume_video();
            thread::sleep(Duration::from_millis(300));
            handle.close();
            thread::sleep(Duration::from_millis(300));
        }
        "review" => {
            info!("Scenario: capture with review, completed from the UI");
            ui.capture_photo();
            thread::sleep(Duration::from_millis(400));
            ui.complete_review();
            thread::sleep(Duration::from_millis(300));
        }
        other => bail!("unknown scenario '{}'", other),
    }

    let (photo_state, video_state) = engine_states(&orchestrator)?;
    let pictures_received = ui_picture_count(&ui)?;

    info!("Stopping preview and shutting the engine down");
    orchestrator.stop_preview_blocking()?;
    orchestrator.close_camera();
    thread::sleep(Duration::from_millis(100));
    orchestrator.shutdown();
    ui.release();

    let summary = SessionSummary {
        session_id: Uuid::new_v4().to_string(),
        scenario: scenario.to_string(),
        started_at,
        finished_at: Utc::now(),
        pictures_received,
        final_photo_state: format!("{:?}", photo_state),
        final_video_state: format!("{:?}", video_state),
        backend_calls: camera_ctl
            .calls()
            .iter()
            .map(|call| format!("{:?}", call))
            .collect(),
    };
    let summary_path = output_dir.join(format!(
        "session-{}.json",
        started_at.format("%Y%m%d-%H%M%S")
    ));
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)
        .with_context(|| format!("writing session summary to {:?}", summary_path))?;

    println!("✓ Scenario '{}' completed", scenario);
    println!("  pictures received: {}", pictures_received);
    println!("  summary: {}", summary_path.display());
    Ok(())
}

fn engine_states(orchestrator: &CaptureOrchestrator) -> Result<(CaptureState, CaptureState)> {
    let (tx, rx) = channel::bounded(1);
    if !orchestrator.with_engine(move |state| {
        let _ = tx.send((state.photo.state.get(), state.video.state.get()));
    }) {
        bail!("engine has no live message queue");
    }
    rx.recv_timeout(Duration::from_secs(5))
        .context("engine state query timed out")
}

fn ui_picture_count(ui: &UiProxy) -> Result<u32> {
    let (tx, rx) = channel::bounded(1);
    if !ui.with_ui(move |state| {
        let _ = tx.send(state.pictures_received);
    }) {
        bail!("UI proxy has no live message queue");
    }
    rx.recv_timeout(Duration::from_secs(5))
        .context("UI state query timed out")
}

fn init_logging(args: &Args) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    // Create environment filter
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("camrig={}", log_level)));

    // Configure format based on options
    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
    };

    let registry = tracing_subscriber::registry().with(fmt_layer).with(env_filter);

    // Optional non-blocking file output
    if let Some(path) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path))?;
        let (writer, guard) = tracing_appender::non_blocking(file);
        registry
            .with(fmt::layer().with_writer(writer).with_ansi(false))
            .init();
        return Ok(Some(guard));
    }

    registry.init();
    Ok(None)
}

/// Print default configuration in TOML format
fn print_default_config() {
    println!("# Camrig Configuration File");
    println!("# This is the default configuration with all available options");
    println!();

    match toml::to_string_pretty(&EngineConfig::default()) {
        Ok(rendered) => println!("{}", rendered),
        Err(e) => eprintln!("Failed to render default configuration: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn photo_scenario_writes_a_session_summary() {
        let output = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.demo.output_dir = output.path().to_string_lossy().into_owned();
        config.capture.record_start_delay_ms = 30;

        run_scenario("photo", config).unwrap();

        let summaries: Vec<_> = std::fs::read_dir(output.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("session-")
            })
            .collect();
        assert_eq!(summaries.len(), 1);

        let raw = std::fs::read_to_string(summaries[0].path()).unwrap();
        let summary: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(summary["scenario"], "photo");
        assert_eq!(summary["pictures_received"], 1);
        assert_eq!(summary["final_photo_state"], "Ready");
    }

    #[test]
    fn unknown_scenario_is_an_error() {
        let output = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.demo.output_dir = output.path().to_string_lossy().into_owned();

        assert!(run_scenario("timelapse", config).is_err());
    }
}
