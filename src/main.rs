use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use voxrelay::config::{self, Config, ConfigHandle};
use voxrelay::Daemon;

/// voxrelay - MQTT voice dialog gateway for IoT devices
#[derive(Parser)]
#[command(name = "voxrelay", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "VOXRELAY_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // configuration first; logging level may come from it
    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load {}: {e}", cli.config.display());
            return ExitCode::FAILURE;
        }
    };

    let filter = match cli.verbose {
        0 => format!("{level},voxrelay={level}", level = config.logger.level),
        1 => "info,voxrelay=debug".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: Config) -> anyhow::Result<()> {
    let handle = ConfigHandle::new(config);

    // hot reload: snapshot swaps on file change
    let _watcher = match config::watch(cli.config.clone(), handle.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "configuration watch unavailable, hot reload disabled");
            None
        }
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    Daemon::new(handle).run(shutdown).await?;
    Ok(())
}
