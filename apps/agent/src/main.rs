//! linkdeploy agent: serves CONFIG/UPLOAD/RUN on a serial or TCP endpoint.

mod app;
mod config;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "linkdeploy-agent", version, about = "Device-side deploy agent")]
struct Cli {
    /// Settings file (default: ~/.config/linkdeploy/agent.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Endpoint override, e.g. /dev/ttyGS0 or tcp-listen://0.0.0.0:7000.
    #[arg(long)]
    port: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load(cli.config.as_deref())?;

    let log_path = config.log_path();
    let log_error = init_logging(&log_path).err();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "linkdeploy agent starting");
    match log_error {
        Some(e) => tracing::warn!(path = %log_path.display(), error = %e, "application log unavailable"),
        None => tracing::info!(path = %log_path.display(), "appending to application log"),
    }
    if config.log_inside_app_dir() {
        tracing::warn!(
            path = %log_path.display(),
            "log file is inside the deploy directory; a deploy there will delete it"
        );
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, cli.port))?;

    Ok(())
}

/// Console output plus a plain-text copy appended to `log_path`.
///
/// When the log file cannot be opened the console layer is still installed
/// and the open error is returned for reporting.
fn init_logging(log_path: &Path) -> std::io::Result<()> {
    let file = log_path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| OpenOptions::new().create(true).append(true).open(log_path));

    let (file_layer, error) = match file {
        Ok(file) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
