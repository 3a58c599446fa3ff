//! Deploy orchestrator.
//!
//! Builds the archive once, then runs whole attempts against fresh links
//! with exponential backoff in between, and reports progress events.

use linkdeploy_transfer::ArchiveBlob;
use linkdeploy_transport::LinkOpener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::controller::ControllerSession;
use crate::error::DeployError;
use crate::project::Project;
use crate::types::{DeployEvent, DeployOptions, DeployReport, RunReport};

/// Orchestrates one project deployment to one agent.
pub struct DeployOrchestrator {
    options: DeployOptions,
    events_tx: mpsc::Sender<DeployEvent>,
    events_rx: Option<mpsc::Receiver<DeployEvent>>,
    cancel: CancellationToken,
}

impl Default for DeployOrchestrator {
    fn default() -> Self {
        Self::new(DeployOptions::default())
    }
}

impl DeployOrchestrator {
    /// Creates a new orchestrator.
    pub fn new(options: DeployOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            options,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<DeployEvent>> {
        self.events_rx.take()
    }

    /// Returns a cancellation token for this deployment.
    ///
    /// Cancellation takes effect between attempts; an attempt in flight
    /// runs to its own end.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Packs `project` and deploys it.
    pub async fn deploy_project(
        &self,
        opener: &dyn LinkOpener,
        project: &Project,
    ) -> Result<DeployReport, DeployError> {
        let packed = {
            let project = project.clone();
            tokio::task::spawn_blocking(move || {
                let archive = project.build_archive()?;
                let payload = project.config_payload()?;
                Ok::<_, DeployError>((archive, payload))
            })
            .await
        };

        let (archive, payload) = match packed.map_err(DeployError::from).and_then(|r| r) {
            Ok(packed) => packed,
            Err(e) => {
                error!(error = %e, "failed to pack project");
                self.emit(DeployEvent::Failed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        self.emit(DeployEvent::ArchiveBuilt {
            files: archive.entries().len(),
            size: archive.size(),
            digest: archive.digest().to_string(),
        });

        self.deploy(opener, &payload, &archive).await
    }

    /// Deploys an already built archive, retrying whole attempts.
    ///
    /// Every attempt reuses the same archive and resends the full
    /// sequence from `CONFIG`.
    pub async fn deploy(
        &self,
        opener: &dyn LinkOpener,
        config_json: &[u8],
        archive: &ArchiveBlob,
    ) -> Result<DeployReport, DeployError> {
        match self.deploy_with_retries(opener, config_json, archive).await {
            Ok(report) => {
                info!(
                    attempt = report.attempts,
                    exit_code = ?report.run.as_ref().and_then(|r| r.exit_code),
                    "deploy completed"
                );
                self.emit(DeployEvent::Completed);
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "deploy failed");
                self.emit(DeployEvent::Failed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn deploy_with_retries(
        &self,
        opener: &dyn LinkOpener,
        config_json: &[u8],
        archive: &ArchiveBlob,
    ) -> Result<DeployReport, DeployError> {
        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            self.check_cancelled()?;
            info!(attempt, max_attempts, "attempt started");
            self.emit(DeployEvent::AttemptStarted {
                attempt,
                max_attempts,
            });

            match self.attempt(opener, config_json, archive).await {
                Ok(run) => {
                    self.emit(DeployEvent::Uploaded { attempt });
                    return Ok(DeployReport {
                        attempts: attempt,
                        size: archive.size(),
                        digest: archive.digest().to_string(),
                        run,
                    });
                }
                Err(e) => {
                    last_reason = e.reason();
                    warn!(attempt, reason = %last_reason, "attempt failed");
                    self.emit(DeployEvent::AttemptFailed {
                        attempt,
                        reason: last_reason.clone(),
                    });
                }
            }

            if attempt < max_attempts {
                let delay = self.options.retry.delay_for_attempt(attempt);
                info!(delay_ms = delay.as_millis() as u64, "retrying after backoff");
                self.emit(DeployEvent::Retrying {
                    next_attempt: attempt + 1,
                    delay,
                });

                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(DeployError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        Err(DeployError::Exhausted {
            attempts: max_attempts,
            last: last_reason,
        })
    }

    async fn attempt(
        &self,
        opener: &dyn LinkOpener,
        config_json: &[u8],
        archive: &ArchiveBlob,
    ) -> Result<Option<RunReport>, DeployError> {
        let mut link = opener.open().await?;
        let mut session = ControllerSession::new(&mut link, &self.options, &self.events_tx);
        session.run(config_json, archive).await
    }

    fn check_cancelled(&self) -> Result<(), DeployError> {
        if self.cancel.is_cancelled() {
            Err(DeployError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Queues an event. Events are dropped while nobody drains the
    /// receiver and the channel is full.
    fn emit(&self, event: DeployEvent) {
        let _ = self.events_tx.try_send(event);
    }
}
