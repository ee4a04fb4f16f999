use clap::Parser;
use miette::IntoDiagnostic;
use sitesync::batch::run_all;
use sitesync::store::MemoryStore;
use sitesync::{AppConfig, LogFormat, SyncEngine};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Runs one sync pass over the sources in a configuration file and prints a JSON report.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the TOML configuration file.
    #[clap(short, long, value_name = "FILE")]
    config: PathBuf,
    /// Maximum number of pages fetched per source.
    #[clap(long)]
    max_pages: Option<usize>,
    /// Requests per minute shared by all sources.
    #[clap(long)]
    rpm: Option<u32>,
    /// User-Agent sent with every request and matched against robots.txt.
    #[clap(long)]
    user_agent: Option<String>,
    /// Log output format.
    #[clap(long, value_enum)]
    log_format: Option<CliLogFormat>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliLogFormat {
    Text,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

fn init_tracing(log_level: &str, log_format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into());

    match log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let args = CliArgs::parse();
    let app = AppConfig::load(&args.config)?;

    let log_format = args.log_format.map(LogFormat::from).unwrap_or(app.log_format);
    init_tracing(app.log_level.as_deref().unwrap_or("info"), log_format);

    let mut engine_config = app.engine.clone().with_env_overrides();
    if let Some(max_pages) = args.max_pages {
        engine_config.max_pages = max_pages;
    }
    if let Some(rpm) = args.rpm {
        engine_config.requests_per_minute = rpm;
    }
    if let Some(user_agent) = args.user_agent {
        engine_config.user_agent = user_agent;
    }

    let engine = SyncEngine::new(engine_config)?;
    let store = MemoryStore::with_sources(app.sources.into_iter().map(|seed| seed.into_record()));

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling sync");
            ctrl_c_cancel.cancel();
        }
    });

    let report = run_all(&engine, &store, &store, &cancel).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).into_diagnostic()?
    );
    Ok(())
}
