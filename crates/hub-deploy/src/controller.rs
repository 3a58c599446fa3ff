//! One deploy attempt over one link.

use std::time::Duration;

use linkdeploy_protocol::constants::PAYLOAD_CHUNK_SIZE;
use linkdeploy_protocol::{Command, Reply, UploadHeader};
use linkdeploy_transfer::ArchiveBlob;
use linkdeploy_transport::{Link, LinkError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DeployError, Stage};
use crate::types::{DeployEvent, DeployOptions, RunReport};

/// Where an attempt currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    SentConfig,
    ConfigAcked,
    SentUploadHeader,
    HeaderAcked,
    StreamingBytes,
    AwaitingResult,
    Succeeded,
    Failed,
}

/// Drives the `CONFIG` / `UPLOAD` / `RUN` exchange for a single attempt.
///
/// Nothing is resumed across attempts: a failed attempt is abandoned and
/// the caller starts a new session on a fresh link.
pub struct ControllerSession<'a> {
    link: &'a mut Link,
    options: &'a DeployOptions,
    events_tx: &'a mpsc::Sender<DeployEvent>,
    state: AttemptState,
}

impl<'a> ControllerSession<'a> {
    pub fn new(
        link: &'a mut Link,
        options: &'a DeployOptions,
        events_tx: &'a mpsc::Sender<DeployEvent>,
    ) -> Self {
        Self {
            link,
            options,
            events_tx,
            state: AttemptState::Idle,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Runs the attempt to completion.
    ///
    /// On success returns the run report (`None` when `RUN` is disabled).
    /// Any `ERR_*` reply, wait-budget overrun or link failure fails the
    /// attempt.
    pub async fn run(
        &mut self,
        config_json: &[u8],
        archive: &ArchiveBlob,
    ) -> Result<Option<RunReport>, DeployError> {
        match self.exchange(config_json, archive).await {
            Ok(report) => {
                self.transition(AttemptState::Succeeded);
                Ok(report)
            }
            Err(e) => {
                self.transition(AttemptState::Failed);
                Err(e)
            }
        }
    }

    async fn exchange(
        &mut self,
        config_json: &[u8],
        archive: &ArchiveBlob,
    ) -> Result<Option<RunReport>, DeployError> {
        self.link.discard_pending(self.options.settle).await?;

        info!(size = config_json.len(), "sending CONFIG");
        self.send_line(&Command::Config {
            size: config_json.len(),
        })
        .await?;
        self.link.write_all(config_json).await?;
        self.link.flush().await?;
        self.transition(AttemptState::SentConfig);

        self.await_ack(Stage::Config).await?;
        self.transition(AttemptState::ConfigAcked);

        let header = UploadHeader {
            size: archive.size(),
            digest: archive.digest().to_string(),
            name: linkdeploy_protocol::constants::ARCHIVE_NAME.to_string(),
        };
        info!(size = header.size, digest = %header.digest, "sending UPLOAD header");
        self.send_line(&Command::Upload(header)).await?;
        self.transition(AttemptState::SentUploadHeader);

        self.await_ack(Stage::Header).await?;
        self.transition(AttemptState::HeaderAcked);

        self.transition(AttemptState::StreamingBytes);
        self.stream_payload(archive).await?;

        self.transition(AttemptState::AwaitingResult);
        self.await_result(archive.size()).await?;

        if !self.options.run {
            info!("upload complete; RUN disabled");
            return Ok(None);
        }
        Ok(Some(self.run_and_observe().await?))
    }

    fn transition(&mut self, next: AttemptState) {
        debug!(from = ?self.state, to = ?next, "attempt state");
        self.state = next;
    }

    async fn send_line(&mut self, command: &Command) -> Result<(), DeployError> {
        debug!(%command, "-> agent");
        self.link.write_line(&command.to_string()).await?;
        Ok(())
    }

    /// Reads one reply within `budget`, logging it.
    async fn next_reply(&mut self, budget: Duration) -> Result<Option<Reply>, LinkError> {
        match self.link.read_line(budget).await? {
            Some(line) => {
                info!("-> agent: {line}");
                Ok(Some(Reply::parse(&line)))
            }
            None => Ok(None),
        }
    }

    /// Waits for the positive acknowledgement of `stage` within the ack
    /// budget. Unrelated lines are logged and skipped.
    async fn await_ack(&mut self, stage: Stage) -> Result<(), DeployError> {
        let deadline = Instant::now() + self.options.ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DeployError::AckTimeout(stage));
            }

            let reply = match self.next_reply(remaining).await {
                Ok(Some(reply)) => reply,
                Ok(None) => return Err(DeployError::LinkClosed),
                Err(LinkError::Timeout) => return Err(DeployError::AckTimeout(stage)),
                Err(LinkError::LineTooLong(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            match (stage, reply) {
                (Stage::Config, Reply::OkConfig) | (Stage::Header, Reply::Ok) => return Ok(()),
                (_, Reply::Err(e)) => {
                    warn!(?stage, reply = %e, "agent refused");
                    return Err(DeployError::Rejected(e));
                }
                (_, other) => debug!(%other, "ignoring line while waiting for ack"),
            }
        }
    }

    /// Writes the archive and picks up any replies already waiting so the
    /// agent never blocks on a full reply buffer.
    ///
    /// Replies are only drained before a chunk goes out; `DONE` cannot
    /// arrive before the final chunk has been written.
    async fn stream_payload(&mut self, archive: &ArchiveBlob) -> Result<(), DeployError> {
        let total = archive.size();
        info!(bytes = total, "sending archive bytes");

        for chunk in archive.bytes().chunks(PAYLOAD_CHUNK_SIZE) {
            self.drain_ready_replies(total).await?;
            self.link.write_all(chunk).await?;
        }
        self.link.flush().await?;

        info!(bytes = total, "finished sending; waiting for DONE");
        Ok(())
    }

    async fn drain_ready_replies(&mut self, total: u64) -> Result<(), DeployError> {
        loop {
            let reply = match self.next_reply(Duration::ZERO).await {
                Ok(Some(reply)) => reply,
                Ok(None) => return Err(DeployError::LinkClosed),
                Err(LinkError::Timeout) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            match reply {
                Reply::Progress(received) => self.emit(DeployEvent::Progress { received, total }),
                Reply::Err(e) => return Err(DeployError::Rejected(e)),
                other => debug!(%other, "ignoring line while streaming"),
            }
        }
    }

    /// Waits for `DONE`. Each `PROGRESS` line restarts the idle budget.
    async fn await_result(&mut self, total: u64) -> Result<(), DeployError> {
        loop {
            let reply = match self.next_reply(self.options.result_idle_timeout).await {
                Ok(Some(reply)) => reply,
                Ok(None) => return Err(DeployError::LinkClosed),
                Err(LinkError::Timeout) => return Err(DeployError::AckTimeout(Stage::Result)),
                Err(LinkError::LineTooLong(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            match reply {
                Reply::Done => return Ok(()),
                Reply::Progress(received) => self.emit(DeployEvent::Progress { received, total }),
                Reply::Err(e) => {
                    warn!(reply = %e, "agent refused the upload");
                    return Err(DeployError::Rejected(e));
                }
                other => debug!(%other, "ignoring line while waiting for DONE"),
            }
        }
    }

    /// Sends `RUN` and relays replies until `EXIT` or the window closes.
    async fn run_and_observe(&mut self) -> Result<RunReport, DeployError> {
        info!("upload successful; sending RUN");
        self.send_line(&Command::Run).await?;

        let mut report = RunReport::default();
        let deadline = Instant::now() + self.options.observe_window;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let line = match self.link.read_line(remaining).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("agent closed the link during run");
                    break;
                }
                Err(LinkError::Timeout) => break,
                Err(LinkError::LineTooLong(_)) => continue,
                Err(e) => {
                    warn!(error = %e, "link failed during run");
                    break;
                }
            };
            info!("-> agent (run): {line}");

            match Reply::parse(&line) {
                Reply::Running => {
                    report.started = true;
                    self.emit(DeployEvent::Running);
                }
                Reply::Exit(code) => {
                    report.exit_code = Some(code);
                    self.emit(DeployEvent::Exited { code });
                    break;
                }
                Reply::Err(e) if e.kind.concerns_run() => {
                    let text = e.to_string();
                    warn!(reply = %text, "agent could not run the program");
                    report.error = Some(text.clone());
                    self.emit(DeployEvent::Output { line: text });
                    if !report.started {
                        break;
                    }
                }
                _ => {
                    report.output_lines += 1;
                    self.emit(DeployEvent::Output { line });
                }
            }
        }

        Ok(report)
    }

    fn emit(&self, event: DeployEvent) {
        if let Err(e) = self.events_tx.try_send(event) {
            debug!(error = %e, "deploy event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkdeploy_protocol::DeploymentConfig;
    use linkdeploy_transfer::build_archive;

    const WAIT: Duration = Duration::from_secs(5);

    fn archive() -> (tempfile::TempDir, ArchiveBlob) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "print('hi')\n").unwrap();
        std::fs::write(dir.path().join("config.json"), "{}").unwrap();
        let blob = build_archive(dir.path(), &DeploymentConfig::default()).unwrap();
        (dir, blob)
    }

    fn options() -> DeployOptions {
        DeployOptions {
            ack_timeout: Duration::from_secs(2),
            result_idle_timeout: Duration::from_secs(2),
            observe_window: Duration::from_secs(2),
            settle: Duration::from_millis(10),
            ..DeployOptions::default()
        }
    }

    /// Reads CONFIG and its payload; returns the payload.
    async fn expect_config(agent: &mut Link) -> Vec<u8> {
        let line = agent.read_line(WAIT).await.unwrap().unwrap();
        let Command::Config { size } = Command::parse(&line).unwrap() else {
            panic!("expected CONFIG, got {line}");
        };
        agent.read_exact_bytes(size, WAIT).await.unwrap()
    }

    async fn expect_upload(agent: &mut Link) -> (UploadHeader, Vec<u8>) {
        let line = agent.read_line(WAIT).await.unwrap().unwrap();
        let Command::Upload(header) = Command::parse(&line).unwrap() else {
            panic!("expected UPLOAD, got {line}");
        };
        agent.write_line("OK").await.unwrap();
        let bytes = agent
            .read_exact_bytes(header.size as usize, WAIT)
            .await
            .unwrap();
        (header, bytes)
    }

    #[tokio::test]
    async fn full_exchange_succeeds() {
        let (_dir, blob) = archive();
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut link = Link::new(a);
        let mut agent = Link::new(b);
        let opts = options();
        let (tx, mut rx) = mpsc::channel(64);

        let expected_digest = blob.digest().to_string();
        let agent_task = tokio::spawn(async move {
            let payload = expect_config(&mut agent).await;
            let config = DeploymentConfig::from_json(&payload).unwrap();
            assert_eq!(config.main, "main.py");
            agent.write_line("OK_CONFIG").await.unwrap();

            let (header, bytes) = expect_upload(&mut agent).await;
            assert_eq!(header.digest, expected_digest);
            assert_eq!(linkdeploy_transfer::checksum_bytes(&bytes), header.digest);
            agent
                .write_line(&format!("PROGRESS {}", bytes.len()))
                .await
                .unwrap();
            agent.write_line("DONE").await.unwrap();

            assert_eq!(agent.read_line(WAIT).await.unwrap().unwrap(), "RUN");
            agent.write_line("RUNNING").await.unwrap();
            agent.write_line("hello from device").await.unwrap();
            agent.write_line("EXIT 0").await.unwrap();
        });

        let config_json = DeploymentConfig::default().to_json().unwrap();
        let mut session = ControllerSession::new(&mut link, &opts, &tx);
        let report = session.run(&config_json, &blob).await.unwrap().unwrap();
        assert_eq!(session.state(), AttemptState::Succeeded);
        agent_task.await.unwrap();

        assert!(report.started);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.output_lines, 1);

        drop(tx);
        let mut events = Vec::new();
        while let Some(e) = rx.recv().await {
            events.push(e);
        }
        assert!(events.contains(&DeployEvent::Running));
        assert!(events.contains(&DeployEvent::Output {
            line: "hello from device".into()
        }));
        assert!(events.contains(&DeployEvent::Exited { code: 0 }));
        assert!(events.iter().any(|e| matches!(e, DeployEvent::Progress { .. })));
    }

    #[tokio::test]
    async fn error_reply_fails_the_attempt() {
        let (_dir, blob) = archive();
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut link = Link::new(a);
        let mut agent = Link::new(b);
        let opts = options();
        let (tx, _rx) = mpsc::channel(64);

        tokio::spawn(async move {
            expect_config(&mut agent).await;
            agent.write_line("OK_CONFIG").await.unwrap();
            expect_upload(&mut agent).await;
            agent.write_line("ERR_CHECKSUM 00ff").await.unwrap();
        });

        let mut session = ControllerSession::new(&mut link, &opts, &tx);
        let err = session.run(b"{}", &blob).await.unwrap_err();
        assert_eq!(err.reason(), "ERR_CHECKSUM 00ff");
        assert_eq!(session.state(), AttemptState::Failed);
    }

    #[tokio::test]
    async fn extraction_error_is_a_failure() {
        let (_dir, blob) = archive();
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut link = Link::new(a);
        let mut agent = Link::new(b);
        let opts = options();
        let (tx, _rx) = mpsc::channel(64);

        tokio::spawn(async move {
            expect_config(&mut agent).await;
            agent.write_line("OK_CONFIG").await.unwrap();
            expect_upload(&mut agent).await;
            agent.write_line("ERR_EXTRACT disk full").await.unwrap();
        });

        let mut session = ControllerSession::new(&mut link, &opts, &tx);
        let err = session.run(b"{}", &blob).await.unwrap_err();
        assert_eq!(err.reason(), "ERR_EXTRACT disk full");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_times_out_on_config() {
        let (_dir, blob) = archive();
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut link = Link::new(a);
        let _agent = Link::new(b);
        let opts = options();
        let (tx, _rx) = mpsc::channel(64);

        let mut session = ControllerSession::new(&mut link, &opts, &tx);
        let err = session.run(b"{}", &blob).await.unwrap_err();
        assert_eq!(err.reason(), "TIMEOUT_OK_CONFIG");
        assert_eq!(session.state(), AttemptState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_keeps_result_wait_alive() {
        let (_dir, blob) = archive();
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut link = Link::new(a);
        let mut agent = Link::new(b);
        let opts = DeployOptions {
            result_idle_timeout: Duration::from_secs(1),
            run: false,
            ..options()
        };
        let (tx, _rx) = mpsc::channel(64);

        let agent_task = tokio::spawn(async move {
            expect_config(&mut agent).await;
            agent.write_line("OK_CONFIG").await.unwrap();
            expect_upload(&mut agent).await;
            // Total silence exceeds the idle budget; each gap does not.
            for n in 1..=4u64 {
                tokio::time::sleep(Duration::from_millis(600)).await;
                agent.write_line(&format!("PROGRESS {n}")).await.unwrap();
            }
            agent.write_line("DONE").await.unwrap();
            // Controller must not send RUN.
            assert!(agent.read_line(WAIT).await.unwrap().is_none());
        });

        let mut session = ControllerSession::new(&mut link, &opts, &tx);
        let report = session.run(b"{}", &blob).await.unwrap();
        assert!(report.is_none());

        drop(session);
        drop(link);
        agent_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_after_payload_is_timeout_result() {
        let (_dir, blob) = archive();
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut link = Link::new(a);
        let mut agent = Link::new(b);
        let opts = options();
        let (tx, _rx) = mpsc::channel(64);

        let agent_task = tokio::spawn(async move {
            expect_config(&mut agent).await;
            agent.write_line("OK_CONFIG").await.unwrap();
            expect_upload(&mut agent).await;
            agent
        });

        let mut session = ControllerSession::new(&mut link, &opts, &tx);
        let err = session.run(b"{}", &blob).await.unwrap_err();
        assert_eq!(err.reason(), "TIMEOUT_RESULT");
        drop(agent_task.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn exit_ends_observation_early() {
        let (_dir, blob) = archive();
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut link = Link::new(a);
        let mut agent = Link::new(b);
        let opts = DeployOptions {
            observe_window: Duration::from_secs(600),
            ..options()
        };
        let (tx, _rx) = mpsc::channel(64);

        let agent_task = tokio::spawn(async move {
            expect_config(&mut agent).await;
            agent.write_line("OK_CONFIG").await.unwrap();
            expect_upload(&mut agent).await;
            agent.write_line("DONE").await.unwrap();
            agent.read_line(WAIT).await.unwrap();
            agent.write_line("RUNNING").await.unwrap();
            agent.write_line("EXIT 3").await.unwrap();
            agent
        });

        let start = Instant::now();
        let mut session = ControllerSession::new(&mut link, &opts, &tx);
        let report = session.run(b"{}", &blob).await.unwrap().unwrap();
        assert_eq!(report.exit_code, Some(3));
        assert!(start.elapsed() < Duration::from_secs(600));
        drop(agent_task.await.unwrap());
    }

    #[tokio::test]
    async fn run_error_is_reported_not_retried() {
        let (_dir, blob) = archive();
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut link = Link::new(a);
        let mut agent = Link::new(b);
        let opts = options();
        let (tx, _rx) = mpsc::channel(64);

        let agent_task = tokio::spawn(async move {
            expect_config(&mut agent).await;
            agent.write_line("OK_CONFIG").await.unwrap();
            expect_upload(&mut agent).await;
            agent.write_line("DONE").await.unwrap();
            agent.read_line(WAIT).await.unwrap();
            agent
                .write_line("ERR_RUN main not found: /deploy/main.py")
                .await
                .unwrap();
            agent
        });

        let mut session = ControllerSession::new(&mut link, &opts, &tx);
        let report = session.run(b"{}", &blob).await.unwrap().unwrap();
        assert!(!report.started);
        assert_eq!(
            report.error.as_deref(),
            Some("ERR_RUN main not found: /deploy/main.py")
        );
        drop(agent_task.await.unwrap());
    }

    #[tokio::test]
    async fn error_looking_program_output_is_just_output() {
        let (_dir, blob) = archive();
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut link = Link::new(a);
        let mut agent = Link::new(b);
        let opts = options();
        let (tx, mut rx) = mpsc::channel(64);

        let agent_task = tokio::spawn(async move {
            expect_config(&mut agent).await;
            agent.write_line("OK_CONFIG").await.unwrap();
            expect_upload(&mut agent).await;
            agent.write_line("DONE").await.unwrap();
            agent.read_line(WAIT).await.unwrap();
            agent.write_line("RUNNING").await.unwrap();
            agent.write_line("ERROR: sensor offline").await.unwrap();
            agent.write_line("ERR_SENSOR retrying").await.unwrap();
            agent.write_line("EXIT 0").await.unwrap();
            agent
        });

        let mut session = ControllerSession::new(&mut link, &opts, &tx);
        let report = session.run(b"{}", &blob).await.unwrap().unwrap();
        assert!(report.started);
        assert_eq!(report.error, None);
        assert_eq!(report.output_lines, 2);
        assert_eq!(report.exit_code, Some(0));
        drop(agent_task.await.unwrap());

        drop(session);
        drop(tx);
        let mut output = Vec::new();
        while let Some(event) = rx.recv().await {
            if let DeployEvent::Output { line } = event {
                output.push(line);
            }
        }
        assert_eq!(output, ["ERROR: sensor offline", "ERR_SENSOR retrying"]);
    }

    #[tokio::test]
    async fn stale_input_is_discarded_first() {
        let (_dir, blob) = archive();
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut link = Link::new(a);
        let mut agent = Link::new(b);
        let opts = DeployOptions {
            run: false,
            ..options()
        };
        let (tx, _rx) = mpsc::channel(64);

        // Leftovers from an earlier, abandoned attempt.
        agent.write_line("OK_CONFIG").await.unwrap();
        agent.write_line("DONE").await.unwrap();

        let agent_task = tokio::spawn(async move {
            expect_config(&mut agent).await;
            agent.write_line("ERR_CONFIG_PARSE").await.unwrap();
            agent
        });

        let mut session = ControllerSession::new(&mut link, &opts, &tx);
        let err = session.run(b"{}", &blob).await.unwrap_err();
        assert_eq!(err.reason(), "ERR_CONFIG_PARSE");
        drop(agent_task.await.unwrap());
    }
}
