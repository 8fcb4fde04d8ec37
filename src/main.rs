use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use reqforge::config::EngineConfig;
use reqforge::error::Result;
use reqforge::llm::build_provider;
use reqforge::orchestrator::Orchestrator;

/// Requirements-engineering orchestration engine.
///
/// Configuration comes from an optional TOML file overridden by the
/// environment (LLM_ENDPOINT, LLM_API_KEY, LLM_PROVIDER,
/// MAX_CONCURRENT_LLM, MAX_SESSIONS, IDLE_TIMEOUT_SECONDS, STORE_PATH).
#[derive(Parser)]
#[command(name = "reqforge", version)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the store root directory.
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Verbose (debug) logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("reqforge: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("reqforge=debug")
    } else {
        EnvFilter::new("reqforge=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path).await?,
        None => EngineConfig::default(),
    };
    config.apply_env()?;
    if let Some(store_path) = cli.store_path {
        config.store.path = store_path;
    }
    config.validate()?;

    let provider = build_provider(&config.llm)?;
    let orchestrator = Orchestrator::new(config, provider)?;

    let resumed = orchestrator.recover().await?;
    tracing::info!(resumed, "Engine ready");

    // The transport adapter drives the orchestrator API; the binary itself
    // only keeps the engine alive until interrupted.
    tokio::signal::ctrl_c()
        .await
        .map_err(reqforge::error::EngineError::Io)?;

    tracing::info!("Interrupt received");
    orchestrator.shutdown().await;
    Ok(())
}
