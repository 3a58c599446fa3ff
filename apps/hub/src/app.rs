//! Wires the CLI to the deploy orchestrator and renders its events.

use linkdeploy_hub_deploy::{DeployEvent, DeployOrchestrator, Project};
use linkdeploy_transport::Endpoint;

use crate::Cli;

/// Deploys `cli.folder` once, with retries, and reports the outcome.
pub async fn run(cli: &Cli) -> anyhow::Result<()> {
    let project = Project::load(&cli.folder)?;
    let address = cli.port.as_deref().unwrap_or(&project.config.com_port);
    let endpoint = Endpoint::parse(address, cli.baud)?;
    tracing::info!(%endpoint, "deploying {}", project.root.display());

    let mut orchestrator = DeployOrchestrator::new(cli.deploy_options());

    let printer = orchestrator.take_events().map(|mut events| {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(text) = render(&event) {
                    println!("{text}");
                }
            }
        })
    });

    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("SIGINT received, cancelling deploy");
            cancel.cancel();
        }
    });

    let result = orchestrator.deploy_project(&endpoint, &project).await;

    // Closing the channel lets the printer drain and finish.
    drop(orchestrator);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let report = result?;
    if let Some(code) = report.run.as_ref().and_then(|r| r.exit_code) {
        tracing::info!(code, "program exited");
    }
    Ok(())
}

/// One console line per event worth showing; program output is already
/// logged line by line.
pub fn render(event: &DeployEvent) -> Option<String> {
    let text = match event {
        DeployEvent::ArchiveBuilt {
            files,
            size,
            digest,
        } => format!("packed {files} files, {size} bytes, sha256 {digest}"),
        DeployEvent::AttemptStarted {
            attempt,
            max_attempts,
        } => format!("attempt {attempt}/{max_attempts}"),
        DeployEvent::Progress { received, total } => {
            let percent = if *total == 0 {
                100
            } else {
                received.saturating_mul(100) / total
            };
            format!("uploading {received}/{total} bytes ({percent}%)")
        }
        DeployEvent::AttemptFailed { attempt, reason } => {
            format!("attempt {attempt} failed: {reason}")
        }
        DeployEvent::Retrying {
            next_attempt,
            delay,
        } => format!("retrying in {} ms (attempt {next_attempt})", delay.as_millis()),
        DeployEvent::Uploaded { attempt } => format!("upload verified on attempt {attempt}"),
        DeployEvent::Running => "program started".to_string(),
        DeployEvent::Output { .. } => return None,
        DeployEvent::Exited { code } => format!("program exited with code {code}"),
        DeployEvent::Completed => "deploy completed".to_string(),
        DeployEvent::Failed { error } => format!("deploy failed: {error}"),
    };
    Some(text)
}
