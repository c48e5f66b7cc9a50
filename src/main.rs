use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use ecs_discovery::aws::sdk::SdkClientProvider;
use ecs_discovery::config::{
    ConfigAccountProvider, ConfigProvider, FileConfigProvider, DEFAULT_CONFIG_FILE,
};
use ecs_discovery::exporter::{EcsServiceDiscoveryExporter, MetricProvider};
use ecs_discovery::rate_limiter::{RateLimiter, Telemetry};
use ecs_discovery::VERSION;
use prometheus::{Encoder, Registry, TextEncoder};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Discover ECS scrape targets across AWS accounts and regions
#[derive(Parser, Debug)]
#[command(name = "ecs-discovery", version, about, long_about = None)]
struct Args {
    /// Scrape configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Seconds between discovery cycles
    #[arg(long, default_value_t = 60)]
    interval_secs: u64,

    /// Run a single discovery cycle and exit
    #[arg(long)]
    once: bool,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Log to a file instead of stdout (default location if no path given)
    #[arg(long)]
    log_file: Option<Option<PathBuf>>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(
    level: LogLevel,
    log_file: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(tracing_level) = level.to_tracing_level() else {
        return Ok(None);
    };

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(tracing_level.as_str().to_lowercase()));

    let guard = match log_file {
        Some(log_path) => {
            if let Some(parent) = log_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("Failed to open log file {:?}", log_path))?;

            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .init();
            guard
        }
        None => {
            let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_target(true)
                .init();
            guard
        }
    };

    tracing::info!("ecs-discovery {} started with log level: {:?}", VERSION, level);
    if let Some(log_path) = log_file {
        tracing::info!("Log file: {:?}", log_path);
    }

    Ok(Some(guard))
}

fn get_log_path() -> PathBuf {
    if let Some(data_dir) = dirs::data_local_dir() {
        return data_dir.join("ecs-discovery").join("ecs-discovery.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".ecs-discovery").join("ecs-discovery.log");
    }
    PathBuf::from("ecs-discovery.log")
}

/// Print the registry in text exposition format at debug level
fn dump_metrics(registry: &Registry) {
    if !tracing::enabled!(Level::DEBUG) {
        return;
    }
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => tracing::debug!("Metrics:\n{}", String::from_utf8_lossy(&buffer)),
        Err(e) => tracing::warn!("Failed to encode metrics: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file = args
        .log_file
        .clone()
        .map(|path| path.unwrap_or_else(get_log_path));
    let _log_guard = setup_logging(args.log_level, log_file.as_deref())?;

    let registry = Registry::new();
    let telemetry = Telemetry::new(&registry)?;

    let config_provider = Arc::new(FileConfigProvider::new(&args.config, telemetry.clone()).await?);
    let exporter = Arc::new(EcsServiceDiscoveryExporter::new(
        config_provider.clone(),
        ConfigAccountProvider::from_env(),
        Arc::new(SdkClientProvider::new()),
        RateLimiter::new(telemetry),
    ));
    registry
        .register(Box::new(exporter.inventory_collector()?))
        .context("Failed to register inventory collector")?;

    let providers: Vec<Arc<dyn MetricProvider>> = vec![exporter.clone() as Arc<dyn MetricProvider>];

    let mut interval = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut first = true;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
        }

        // The provider already loaded once on construction
        if !first {
            config_provider.update().await;
        }
        first = false;

        for provider in &providers {
            provider.update().await;
        }
        if let Some(completed_at) = exporter.snapshot().completed_at {
            tracing::info!("Discovery cycle completed at {}", completed_at.to_rfc3339());
        }
        dump_metrics(&registry);

        if args.once {
            break;
        }
    }

    Ok(())
}
