use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use natal_core::api::{self, ApiState};
use natal_core::canary::export_textfile;
use natal_core::config::EngineConfig;
use natal_core::{
    logging, AnalyticEphemeris, Canary, CanaryLabels, ChartEngine, ChartError, ChartGateway,
    ChartService, ComputeChartEvent, EphemerisProvider, FileChartStore, MetricsHealthSink,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// Natal chart engine CLI arguments
#[derive(Debug, Parser)]
#[clap(name = "natal", version, about = "Natal chart computation and validation engine")]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[clap(long, global = true, env = "NATAL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[clap(long, global = true, env = "NATAL_LOG_JSON")]
    log_json: bool,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the chart read endpoint (default if no subcommand given)
    Serve {
        /// Listen address; overrides NATAL_BIND_ADDR
        #[clap(long)]
        bind: Option<String>,
    },
    /// Compute a chart from a birth-data event and store it
    Compute {
        /// Event file path (JSON), or `-` for stdin
        #[clap(long)]
        event_file: PathBuf,

        /// Print the chart without storing it
        #[clap(long)]
        dry_run: bool,
    },
    /// Run the reference canary once and exit non-zero on failure
    Canary {
        /// Output the report as JSON
        #[clap(long)]
        json: bool,

        /// Write Prometheus text for a textfile collector; overrides NATAL_METRICS_TEXTFILE
        #[clap(long)]
        metrics_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = EngineConfig::from_env().context("failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    config.log_json |= cli.log_json;
    logging::init(&config.log_level, config.log_json).context("failed to initialize logging")?;

    let provider: Arc<dyn EphemerisProvider> =
        Arc::new(AnalyticEphemeris::new(config.provider_config()));

    match cli.command.unwrap_or(Commands::Serve { bind: None }) {
        Commands::Serve { bind } => {
            serve(provider, &config, bind).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Compute {
            event_file,
            dry_run,
        } => Ok(compute(provider, &config, &event_file, dry_run).await),
        Commands::Canary { json, metrics_file } => {
            let metrics_file = metrics_file.or_else(|| config.metrics_textfile.clone());
            run_canary(provider, &config, json, metrics_file.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_engine(provider: Arc<dyn EphemerisProvider>) -> Result<ChartEngine> {
    ChartEngine::new(provider).context("ephemeris provider failed validation")
}

fn canary_labels(config: &EngineConfig) -> CanaryLabels {
    CanaryLabels {
        environment: config.environment.clone(),
        name: config.canary_name.clone(),
    }
}

fn chart_service(engine: ChartEngine, config: &EngineConfig) -> Result<ChartService> {
    let store = FileChartStore::open(&config.store_path).with_context(|| {
        format!("failed to open chart store at {}", config.store_path.display())
    })?;
    Ok(ChartService::new(
        engine,
        ChartGateway::new(Arc::new(store)),
        config.default_house_system,
        Duration::from_secs(config.compute_deadline_secs),
    ))
}

async fn serve(
    provider: Arc<dyn EphemerisProvider>,
    config: &EngineConfig,
    bind: Option<String>,
) -> Result<()> {
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    let service = chart_service(build_engine(provider.clone())?, config)?;
    spawn_canary(provider, config);

    let app = api::router(ApiState {
        engine: service.engine().clone(),
        gateway: service.gateway().clone(),
        metrics: Some(metrics),
    });

    let addr = bind.unwrap_or_else(|| config.bind_addr.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(%addr, environment = %config.environment, "serving natal charts");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Keeps `natal_canary_health` current for the `/metrics` scrape.
fn spawn_canary(provider: Arc<dyn EphemerisProvider>, config: &EngineConfig) {
    if config.canary_interval_secs == 0 {
        info!("periodic canary disabled");
        return;
    }
    let canary = Arc::new(Canary::new(
        provider,
        canary_labels(config),
        Arc::new(MetricsHealthSink),
    ));
    let period = Duration::from_secs(config.canary_interval_secs);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let canary = canary.clone();
            // outcome is logged and recorded by the run itself
            if let Err(err) = tokio::task::spawn_blocking(move || canary.run()).await {
                warn!(error = %err, "canary task did not complete");
            }
        }
    });
}

/// Computes one event. Failures map to an exit status that tells the job
/// runner whether the event is worth re-queueing.
async fn compute(
    provider: Arc<dyn EphemerisProvider>,
    config: &EngineConfig,
    event_file: &Path,
    dry_run: bool,
) -> ExitCode {
    match compute_event(provider, config, event_file, dry_run).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<ChartError>()
                .map_or(1, ChartError::exit_code);
            error!(error = %format!("{:#}", err), exit_code = code, "chart computation failed");
            eprintln!("Error: {:#}", err);
            ExitCode::from(code)
        }
    }
}

async fn compute_event(
    provider: Arc<dyn EphemerisProvider>,
    config: &EngineConfig,
    event_file: &Path,
    dry_run: bool,
) -> Result<()> {
    let payload = if event_file == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("failed to read event from stdin")?
    } else {
        std::fs::read_to_string(event_file)
            .with_context(|| format!("failed to read {}", event_file.display()))?
    };

    let service = chart_service(build_engine(provider)?, config)?;
    let chart = if dry_run {
        let request = ComputeChartEvent::from_json(&payload)?
            .to_request(config.default_house_system)?;
        service.compute(request).await?
    } else {
        service.handle_json(&payload).await?
    };

    println!("{}", serde_json::to_string_pretty(&chart)?);
    Ok(())
}

/// Runs the canary once. Metrics are exported before the outcome is
/// returned, so a failing run still leaves `natal_canary_health 0` behind.
fn run_canary(
    provider: Arc<dyn EphemerisProvider>,
    config: &EngineConfig,
    json: bool,
    metrics_file: Option<&Path>,
) -> Result<()> {
    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    let canary = Canary::new(provider, canary_labels(config), Arc::new(MetricsHealthSink));
    let outcome = canary.run();

    if let Some(path) = metrics_file {
        export_textfile(path, &metrics.render())
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    }
    let report = outcome.context("canary check failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "canary {} passed: {} cusps, Sun {:.4}, ASC {:.4}, MC {:.4} in {:?}",
            canary.labels().name,
            report.house_count,
            report.sun_longitude,
            report.ascendant,
            report.midheaven,
            report.elapsed
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        // a failed handler install leaves SIGTERM as the only way out
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
