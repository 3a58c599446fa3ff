//! linkdeploy: packs a project folder and deploys it to an agent.

mod app;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use clap::Parser;
use linkdeploy_hub_deploy::{DeployOptions, RetryPolicy};
use linkdeploy_protocol::constants::DEFAULT_BAUD;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "linkdeploy", version, about = "Deploy a project folder over a serial link")]
pub struct Cli {
    /// Project folder containing config.json.
    #[arg(default_value = ".")]
    pub folder: PathBuf,

    /// Endpoint override for the descriptor's com_port (serial path or tcp://host:port).
    #[arg(long)]
    pub port: Option<String>,

    #[arg(long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,

    /// Total attempts, including the first.
    #[arg(long, default_value_t = 5)]
    pub retries: u32,

    /// Delay after the first failed attempt; doubles each retry.
    #[arg(long, default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// Wait budget for OK_CONFIG and OK.
    #[arg(long, default_value_t = 10)]
    pub ack_timeout_secs: u64,

    /// How long to relay program output after RUN.
    #[arg(long, default_value_t = 10)]
    pub observe_secs: u64,

    /// Local log of the whole exchange.
    #[arg(long, default_value = "send_log.txt")]
    pub log_file: PathBuf,

    /// Stop after the upload is acknowledged.
    #[arg(long)]
    pub no_run: bool,
}

impl Cli {
    pub fn deploy_options(&self) -> DeployOptions {
        DeployOptions {
            retry: RetryPolicy {
                max_attempts: self.retries.max(1),
                base_delay: Duration::from_millis(self.retry_delay_ms),
                max_delay: None,
            },
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            observe_window: Duration::from_secs(self.observe_secs),
            run: !self.no_run,
            ..DeployOptions::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_file) {
        tracing::warn!(path = %cli.log_file.display(), error = %e, "log file unavailable");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "linkdeploy starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(&cli))?;

    Ok(())
}

/// Console output plus a plain-text copy appended to `log_path`.
fn init_logging(log_path: &Path) -> std::io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(log_path);

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
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
