use anyhow::{Context, Result};
use clap::Parser;
use expocam::{
    CaptureEvent, CaptureOrchestrator, EventBus, EventFilter, EventReceiver, ExpocamConfig,
    Image, MedianFilter, PreviewExposureAdvisor, PreviewTarget, PretreatmentGroup,
    SimulatedCameraBuilder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "expocam")]
#[command(about = "Settling-aware camera capture with automatic exposure and gain control")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "expocam.toml", help = "Path to TOML configuration file")]
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

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Take a raw frame without gain or exposure changes
    #[arg(long, help = "Capture a raw frame, bypassing auto-exposure and software gain")]
    raw: bool,

    /// Override the auto-exposure iteration budget
    #[arg(long, value_name = "N", help = "Maximum auto-exposure iterations")]
    iterations: Option<u32>,

    /// Number of captures to take
    #[arg(short = 'n', long, default_value_t = 1, help = "Number of captures to take")]
    count: u32,

    /// Median filter radius applied before measurement
    #[arg(long, value_name = "RADIUS", help = "Median filter radius applied before measurement")]
    median: Option<u32>,

    /// Run preview for the given number of seconds instead of capturing
    #[arg(long, value_name = "SECONDS", help = "Run live preview and report suggested settings")]
    preview_seconds: Option<u64>,

    /// Print capture summaries as JSON
    #[arg(long, help = "Print image summaries as JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting expocam v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match ExpocamConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        eprintln!("✗ Configuration validation failed: {}", e);
        std::process::exit(1);
    }
    if args.validate_config {
        println!("✓ Configuration is valid");
        return Ok(());
    }

    let event_bus = Arc::new(EventBus::new(config.system.event_bus_capacity));
    let orchestrator = Arc::new(CaptureOrchestrator::new(&config, Arc::clone(&event_bus)));

    if let Some(radius) = args.median {
        let group = PretreatmentGroup::new().with_step(Arc::new(MedianFilter::new(radius)));
        orchestrator.set_pretreatment(Some(Arc::new(group)));
    }

    let camera = SimulatedCameraBuilder::new()
        .config(config.simulator.clone())
        .build()?;
    orchestrator
        .connect(Arc::new(camera))
        .await
        .context("Failed to connect camera")?;
    orchestrator.start_camera().await?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let outcome = match args.preview_seconds {
        Some(seconds) => run_preview(&orchestrator, &config, &event_bus, seconds, &cancel).await,
        None => run_captures(&orchestrator, &args, &cancel).await,
    };

    orchestrator.reset().await;

    if let Err(e) = &outcome {
        error!("expocam failed: {:#}", e);
    }
    outcome
}

async fn run_captures(
    orchestrator: &CaptureOrchestrator,
    args: &Args,
    cancel: &CancellationToken,
) -> Result<()> {
    for index in 0..args.count {
        let result = if args.raw {
            orchestrator.capture_raw_only(cancel).await?
        } else if let Some(iterations) = args.iterations {
            orchestrator
                .capture_with_auto_exposure(iterations, cancel)
                .await?
        } else {
            orchestrator.take_image(cancel).await?
        };

        let Some(mut image) = result else {
            warn!("Capture {} cancelled", index + 1);
            break;
        };
        report(&mut image, args.json)?;
    }
    Ok(())
}

async fn run_preview(
    orchestrator: &Arc<CaptureOrchestrator>,
    config: &ExpocamConfig,
    event_bus: &EventBus,
    seconds: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut receiver = EventReceiver::new(
        event_bus.subscribe(),
        EventFilter::EventTypes(vec!["preview_frame"]),
        "preview".to_string(),
    );

    orchestrator.start_preview().await?;

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    let mut frames = 0u64;
    let mut last: Option<Arc<Image>> = None;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = cancel.cancelled() => break,
            event = receiver.recv() => match event {
                Ok(CaptureEvent::PreviewFrame { image }) => {
                    frames += 1;
                    last = Some(image);
                }
                Ok(_) => {}
                Err(e) => warn!("Preview receiver: {}", e),
            },
        }
    }

    orchestrator.stop_preview().await?;
    println!("Preview delivered {} frame(s) in {}s", frames, seconds);

    if let Some(image) = last {
        let params = orchestrator.controller_parameters();
        let target = PreviewTarget {
            max_value: 2f64.powi(image.data_depth() as i32),
            min_level: params.min_level,
            max_level: params.max_level,
        };
        let (exposure_ms, gain) = PreviewExposureAdvisor::new(params.clone()).advise(
            &image,
            params.region.as_ref(),
            target,
        );
        println!(
            "Suggested preview settings: {:.2}ms at gain {:.2} (virtual gain {:.2})",
            exposure_ms, gain, config.capture.preview_virtual_gain
        );
    }
    Ok(())
}

fn report(image: &mut Image, json: bool) -> Result<()> {
    image.compute_statistics();
    let summary = image.summary();

    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!(
            "{}x{} {} | {}ms x{:.2} | level {} | {}",
            summary.width,
            summary.height,
            summary.pixel_format,
            summary.exposure_ms,
            summary.gain,
            summary
                .signal_level
                .map(|level| format!("{:.3}", level))
                .unwrap_or_else(|| "n/a".to_string()),
            summary.control_state
        );
    }
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received interrupt, cancelling");
                cancel.cancel();
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    });
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("expocam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(std::io::stderr)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_writer(std::io::stderr)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .with_writer(std::io::stderr)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

fn print_default_config() -> Result<()> {
    println!("# Expocam configuration file");
    println!("# Default values for every available option");
    println!();
    println!("{}", toml::to_string_pretty(&ExpocamConfig::default())?);
    Ok(())
}
