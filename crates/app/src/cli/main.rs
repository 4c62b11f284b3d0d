//! Ear CLI Application

use anyhow::Context;
use clap::{Parser, ValueEnum};
use ear_app::serve;
use ear_core::domain::backend::mock::MockBackend;
use ear_core::domain::{AudioBackend, BackendKind, ConfigManager, Server};
use ear_infra::CpalBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ear")]
#[command(about = "Multi-zone audio routing controller", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to ~/.config/ear/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Audio engine, overriding the configuration
    #[arg(short, long, value_enum)]
    backend: Option<BackendArg>,

    /// Print the output devices and exit
    #[arg(long)]
    list_drivers: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Cpal,
    Mock,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Cpal => BackendKind::Cpal,
            BackendArg::Mock => BackendKind::Mock,
        }
    }
}

/// `RUST_LOG` wins over the configured level; `--verbose` wins over both
fn init_tracing(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let manager = match cli.config {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(ConfigManager::default_config_dir()?),
    };
    let mut config = manager
        .load()
        .await
        .with_context(|| format!("failed to load {}", manager.config_path().display()))?;

    init_tracing(&config.logging.level, cli.verbose);
    info!(path = %manager.config_path().display(), "Ear starting");

    if let Some(kind) = cli.backend {
        config.backend.kind = kind.into();
    }
    let backend: Arc<dyn AudioBackend> = match config.backend.kind {
        BackendKind::Cpal => Arc::new(CpalBackend::new(config.backend.buffer_size)),
        BackendKind::Mock => Arc::new(MockBackend::with_default_drivers()),
    };

    if cli.list_drivers {
        for driver in backend.drivers()? {
            println!(
                "{}  {:<40} {:>6} Hz  {:>2} ch  {:?}",
                driver.id, driver.name, driver.rate, driver.channels, driver.mode
            );
        }
        return Ok(());
    }

    let server = Server::new(backend, config);
    info!(backend = ?server.config().backend.kind, "Reading commands from stdin");

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        handled = serve(&server, stdin, stdout) => {
            let handled = handled.context("stdio loop failed")?;
            info!(commands = handled, "Input closed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    server.shutdown();
    info!("Ear stopped");
    Ok(())
}
