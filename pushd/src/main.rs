mod config;

use clap::Parser;
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use delivery::config::ValidationError;
use delivery::metrics_defs::ALL_METRICS;
use delivery::router::Router;
use metrics_exporter_statsd::StatsdBuilder;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const METRICS_PREFIX: &str = "pushd";

#[derive(Parser)]
#[command(about = "Delivers push notifications to APNs, FCM and GCM")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short, default_value = "pushd.yaml")]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("no project could be started")]
    NoProjects,
}

fn main() -> Result<(), CliError> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    config.validate()?;

    // Sentry must be set up before the runtime starts.
    let _sentry = init_logging(&config.logging);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config))
}

fn init_logging(logging: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let guard = logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(statsd: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(statsd.statsd_host.clone(), statsd.statsd_port)
        .build(Some(METRICS_PREFIX))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;
    shared::metrics_defs::describe_all(ALL_METRICS);

    tracing::info!(
        host = %statsd.statsd_host,
        port = statsd.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}

async fn run(config: Config) -> Result<(), CliError> {
    if let Some(statsd) = &config.metrics {
        init_metrics(statsd)?;
    }

    let ready = Arc::new(AtomicBool::new(false));
    let flag = ready.clone();
    let admin: AdminService<_, std::io::Error> =
        AdminService::new(move || flag.load(Ordering::Relaxed));
    let listener = config.listener.clone();
    let mut admin_task =
        tokio::spawn(async move { run_http_service(&listener.host, listener.port, admin).await });

    let (router, failures) = Router::from_config(&config.projects);
    if router.is_empty() {
        admin_task.abort();
        return Err(CliError::NoProjects);
    }
    tracing::info!(
        projects = router.len(),
        failed = failures.len(),
        "dispatchers ready"
    );
    ready.store(true, Ordering::Relaxed);

    tokio::select! {
        result = &mut admin_task => {
            match result {
                Ok(served) => served?,
                Err(e) => tracing::error!("admin listener panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            ready.store(false, Ordering::Relaxed);
            admin_task.abort();
        }
    }

    Ok(())
}
