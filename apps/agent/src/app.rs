//! Endpoint loop: one agent session per opened link.

use std::time::Duration;

use linkdeploy_agent_server::{AgentSession, SessionSettings};
use linkdeploy_transport::{Endpoint, LinkOpener};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Pause before reopening the endpoint after a failure.
const REOPEN_PAUSE: Duration = Duration::from_secs(1);

/// Runs the agent until Ctrl-C.
pub async fn run(config: Config, port: Option<String>) -> anyhow::Result<()> {
    let address = port.unwrap_or_else(|| config.port.clone());
    let endpoint = Endpoint::parse(&address, config.baud)?;
    let settings = config.to_session_settings();

    tracing::info!(
        %endpoint,
        app_dir = %settings.app_dir.display(),
        "agent ready"
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, shutting down");
            on_signal.cancel();
        }
    });

    serve(&endpoint, settings, cancel).await;
    tracing::info!("agent stopped");
    Ok(())
}

/// Opens `opener` over and over, serving each link with a fresh
/// [`AgentSession`], until `cancel` fires.
///
/// Every session starts unconfigured. A failed open or a session that
/// dies with a link error is followed by [`REOPEN_PAUSE`].
pub async fn serve(opener: &dyn LinkOpener, settings: SessionSettings, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = opener.open() => opened,
        };

        let failed = match opened {
            Ok(link) => {
                let mut session = AgentSession::new(link, settings.clone());
                match session.run(cancel.clone()).await {
                    Ok(()) => {
                        tracing::info!("session ended");
                        false
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "session ended with error");
                        true
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to open link");
                true
            }
        };

        if failed {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(REOPEN_PAUSE) => {}
            }
        }
    }
}
