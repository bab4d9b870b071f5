use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use framelapse_core::artifacts;
use framelapse_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use framelapse_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, RedactingMakeWriter, DEFAULT_LOG_FILTER,
};
use framelapse_core::server::{app_router, AppState};

#[derive(Parser)]
#[command(name = "framelapse", about = "Timelapse renderer for Immich photo libraries")]
struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(&resolved_data_dir);

    run_server(cli.port, cli.host, resolved_data_dir).await
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(RedactingMakeWriter::new(appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            eprintln!(
                "Warning: persistent file logging unavailable (path: {attempted_log_dir}; reason: {reason}). Continuing with console-only logging."
            );
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    let pid = std::process::id();
    let cfg_path = config_path(data_dir);
    info!(
        pid,
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    if let Err(e) = initialize_data_dir(&data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(&data_dir);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let retention = Duration::from_secs(config.jobs.retention_hours * 3600);
    let reaper_interval = Duration::from_secs(config.jobs.reaper_interval_secs);

    let state = AppState::new(config, &data_dir);

    tokio::spawn(artifacts::run_reaper(
        state.store(),
        state.registry(),
        reaper_interval,
        retention,
    ));

    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting framelapse server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
