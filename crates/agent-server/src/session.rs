//! The agent command loop.

use std::ffi::OsString;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use linkdeploy_file_ops::{
    default_app_dir, replace_directory, resolve_deploy_dir, resolve_entry_point, set_executable,
};
use linkdeploy_protocol::constants::{
    ARCHIVE_NAME, MAX_CONFIG_SIZE, PAYLOAD_CHUNK_SIZE, PAYLOAD_STALL_TIMEOUT, PROGRESS_INTERVAL,
};
use linkdeploy_protocol::{Command, DeploymentConfig, ErrorKind, FrameError, Reply, UploadHeader};
use linkdeploy_transfer::{Digester, unpack_from};
use linkdeploy_transport::{Link, LinkError};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runner::{ProcessSpec, stream_process};
use crate::{AgentError, COMMAND_ERROR_PAUSE};

/// Largest accepted `UPLOAD` payload by default (1 GiB).
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 1024 * 1024 * 1024;

/// Per-agent knobs that shape how commands are served.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Fallback deploy directory and anchor for relative ones.
    pub app_dir: PathBuf,
    /// Where an incoming archive is staged before verification.
    pub staging_file: PathBuf,
    /// Bytes between `PROGRESS` replies.
    pub progress_interval: u64,
    /// Longest silence tolerated inside a payload.
    pub payload_timeout: Duration,
    pub max_upload_size: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        let app_dir = default_app_dir();
        Self {
            staging_file: app_dir.join(ARCHIVE_NAME),
            app_dir,
            progress_interval: PROGRESS_INTERVAL,
            payload_timeout: PAYLOAD_STALL_TIMEOUT,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }
}

/// The descriptor accepted on this connection, if any.
#[derive(Debug, Clone, Default)]
pub struct DeploymentState {
    config: Option<DeploymentConfig>,
}

impl DeploymentState {
    pub fn config(&self) -> Option<&DeploymentConfig> {
        self.config.as_ref()
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }
}

/// Byte accounting for one `UPLOAD` payload.
struct TransferSession {
    expected: UploadHeader,
    digester: Digester,
    last_progress: u64,
    interval: u64,
}

impl TransferSession {
    fn new(expected: UploadHeader, interval: u64) -> Self {
        Self {
            expected,
            digester: Digester::new(),
            last_progress: 0,
            interval: interval.max(1),
        }
    }

    fn received(&self) -> u64 {
        self.digester.bytes()
    }

    fn remaining(&self) -> u64 {
        self.expected.size.saturating_sub(self.received())
    }

    /// Records a chunk; returns the byte count to report if a
    /// `PROGRESS` reply is due.
    fn record(&mut self, chunk: &[u8]) -> Option<u64> {
        self.digester.update(chunk);
        let received = self.received();
        if received - self.last_progress >= self.interval {
            self.last_progress = received;
            Some(received)
        } else {
            None
        }
    }
}

/// How an `UPLOAD` payload ended. Every variant except a link error
/// leaves the link at the next header.
enum Payload {
    Complete(String),
    Stalled,
    Cancelled,
    /// All bytes were consumed but the staging file could not hold them.
    WriteFailed(String),
}

/// A payload read in full, or why it stopped short.
enum Fetched {
    Bytes(Vec<u8>),
    Stalled,
    Cancelled,
}

enum Chunk {
    Data(usize),
    Stalled,
    Cancelled,
}

/// Serves commands from one controller over one link.
pub struct AgentSession {
    link: Link,
    settings: SessionSettings,
    state: DeploymentState,
}

impl AgentSession {
    pub fn new(link: Link, settings: SessionSettings) -> Self {
        Self {
            link,
            settings,
            state: DeploymentState::default(),
        }
    }

    pub fn state(&self) -> &DeploymentState {
        &self.state
    }

    /// Runs the command loop until the peer closes the link, the link
    /// fails, or `cancel` fires.
    ///
    /// A command that fails for any other reason is logged and the loop
    /// moves on to the next header after a short pause.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), AgentError> {
        info!("session ready");
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("session cancelled");
                    return Ok(());
                }
                line = self.link.recv_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("peer closed the link");
                    return Ok(());
                }
                Err(LinkError::LineTooLong(max)) => {
                    warn!(max, "discarding overlong header line");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = self.handle_line(&line, &cancel).await {
                if e.is_link_lost() {
                    return Err(e);
                }
                error!(error = %e, "command failed");
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(COMMAND_ERROR_PAUSE) => {}
                }
            }
        }
    }

    async fn handle_line(
        &mut self,
        line: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(FrameError::Empty) => return Ok(()),
            Err(FrameError::UploadHeader(_)) if !self.state.is_configured() => {
                warn!(header = %line, "UPLOAD received but no config present");
                return self.reply(Reply::error(ErrorKind::NoConfig)).await;
            }
            Err(e) => {
                match e.reply() {
                    Some(reply) => {
                        warn!(header = %line, error = %e, "bad header");
                        self.reply(reply).await?;
                    }
                    None => info!(header = %line, "ignoring unknown command"),
                }
                return Ok(());
            }
        };

        info!(command = %command, "command received");
        match command {
            Command::Config { size } => self.handle_config(size, cancel).await,
            Command::Upload(header) => self.handle_upload(header, cancel).await,
            Command::Run => self.handle_run(cancel).await,
        }
    }

    async fn handle_config(
        &mut self,
        size: usize,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        // An oversized payload is still read off the link, then dropped.
        let oversized = size > MAX_CONFIG_SIZE;
        if oversized {
            warn!(size, max = MAX_CONFIG_SIZE, "CONFIG payload too large; discarding it");
        }

        let raw = match self.fetch(size, !oversized, cancel).await? {
            Fetched::Bytes(raw) => raw,
            Fetched::Stalled => {
                warn!(size, "CONFIG payload stalled");
                return self.reply(Reply::error(ErrorKind::Timeout)).await;
            }
            Fetched::Cancelled => return Ok(()),
        };
        if oversized {
            return self.reply(Reply::error(ErrorKind::ConfigHeader)).await;
        }

        match DeploymentConfig::from_json(&raw) {
            Ok(config) => {
                info!(
                    directory = config.directory.as_deref().unwrap_or("<app dir>"),
                    main = %config.main,
                    args = ?config.args,
                    "config accepted"
                );
                self.state.config = Some(config);
                self.reply(Reply::OkConfig).await
            }
            Err(e) => {
                warn!(error = %e, "failed to parse config; keeping previous");
                self.reply(Reply::error(ErrorKind::ConfigParse)).await
            }
        }
    }

    async fn handle_upload(
        &mut self,
        header: UploadHeader,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let Some(config) = self.state.config.clone() else {
            warn!("UPLOAD received but no config present");
            return self.reply(Reply::error(ErrorKind::NoConfig)).await;
        };

        if header.size > self.settings.max_upload_size {
            warn!(
                size = header.size,
                max = self.settings.max_upload_size,
                "UPLOAD refused: too large"
            );
            return self.reply(Reply::error(ErrorKind::Header)).await;
        }

        let deploy_dir = resolve_deploy_dir(config.directory.as_deref(), &self.settings.app_dir);
        info!(
            name = %header.name,
            size = header.size,
            digest = %header.digest,
            deploy_to = %deploy_dir.display(),
            "upload requested"
        );

        // The staging file must exist before `OK`: once the controller
        // starts sending, every payload byte has to be consumed.
        let staging = self.settings.staging_file.clone();
        let file = match open_staging(&staging).await {
            Ok(file) => file,
            Err(e) => {
                error!(path = %staging.display(), error = %e, "cannot create staging file");
                return self
                    .reply(Reply::error_with(
                        ErrorKind::Header,
                        format!("cannot stage upload: {e}"),
                    ))
                    .await;
            }
        };
        if let Err(e) = self.reply(Reply::Ok).await {
            drop(file);
            discard(&staging).await;
            return Err(e);
        }

        let expected = header.digest.clone();
        let actual = match self.receive_payload(header, file, cancel).await {
            Ok(Payload::Complete(actual)) => actual,
            Ok(Payload::Stalled) => {
                discard(&staging).await;
                return self.reply(Reply::error(ErrorKind::Timeout)).await;
            }
            Ok(Payload::WriteFailed(detail)) => {
                discard(&staging).await;
                return self
                    .reply(Reply::error_with(ErrorKind::Storage, detail))
                    .await;
            }
            Ok(Payload::Cancelled) => {
                discard(&staging).await;
                return Ok(());
            }
            Err(e) => {
                discard(&staging).await;
                return Err(e);
            }
        };

        if !actual.eq_ignore_ascii_case(&expected) {
            warn!(%expected, %actual, "checksum mismatch; waiting for retry");
            discard(&staging).await;
            return self
                .reply(Reply::error_with(ErrorKind::Checksum, actual))
                .await;
        }

        let dir = deploy_dir.clone();
        let extracted =
            tokio::task::spawn_blocking(move || extract_into(&staging, &dir)).await?;

        match extracted {
            Ok(entries) => {
                info!(entries, dir = %deploy_dir.display(), "extraction succeeded");
                self.reply(Reply::Done).await
            }
            Err(e) => {
                error!(error = %e, dir = %deploy_dir.display(), "extraction failed");
                self.reply(Reply::error_with(ErrorKind::Extract, e.to_string()))
                    .await
            }
        }
    }

    /// Streams the payload into `sink`, hashing and reporting progress.
    ///
    /// A failed write stops writing but not reading: the rest of the
    /// payload is still consumed and hashed so the next header lines up.
    async fn receive_payload<W>(
        &mut self,
        header: UploadHeader,
        sink: W,
        cancel: &CancellationToken,
    ) -> Result<Payload, AgentError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut sink = Some(sink);
        let mut write_error: Option<String> = None;
        let mut transfer = TransferSession::new(header, self.settings.progress_interval);
        let mut buf = vec![0u8; PAYLOAD_CHUNK_SIZE];

        while transfer.remaining() > 0 {
            let want = buf.len().min(transfer.remaining() as usize);
            let n = match self.next_chunk(&mut buf[..want], cancel).await? {
                Chunk::Data(n) => n,
                Chunk::Stalled => {
                    warn!(
                        received = transfer.received(),
                        expected = transfer.expected.size,
                        "UPLOAD payload stalled"
                    );
                    return Ok(Payload::Stalled);
                }
                Chunk::Cancelled => {
                    info!(received = transfer.received(), "UPLOAD interrupted by shutdown");
                    return Ok(Payload::Cancelled);
                }
            };

            let written = match sink.as_mut() {
                Some(file) => file.write_all(&buf[..n]).await,
                None => Ok(()),
            };
            if let Err(e) = written {
                error!(
                    error = %e,
                    received = transfer.received(),
                    "staging write failed; draining the rest of the payload"
                );
                write_error = Some(format!("staging write failed: {e}"));
                sink = None;
            }

            if let Some(received) = transfer.record(&buf[..n]) {
                self.reply(Reply::Progress(received)).await?;
            }
        }

        if let Some(mut file) = sink {
            if let Err(e) = file.flush().await {
                error!(error = %e, "staging flush failed");
                write_error = Some(format!("staging write failed: {e}"));
            }
        }
        if let Some(detail) = write_error {
            return Ok(Payload::WriteFailed(detail));
        }

        let received = transfer.received();
        let actual = transfer.digester.finalize_hex();
        info!(received, digest = %actual, "payload received");
        Ok(Payload::Complete(actual))
    }

    /// Reads a `size`-byte payload, keeping the bytes only when `keep` is set.
    async fn fetch(
        &mut self,
        size: usize,
        keep: bool,
        cancel: &CancellationToken,
    ) -> Result<Fetched, AgentError> {
        let mut kept = Vec::with_capacity(if keep { size } else { 0 });
        let mut buf = vec![0u8; PAYLOAD_CHUNK_SIZE.min(size.max(1))];
        let mut remaining = size;

        while remaining > 0 {
            let want = buf.len().min(remaining);
            match self.next_chunk(&mut buf[..want], cancel).await? {
                Chunk::Data(n) => {
                    if keep {
                        kept.extend_from_slice(&buf[..n]);
                    }
                    remaining -= n;
                }
                Chunk::Stalled => return Ok(Fetched::Stalled),
                Chunk::Cancelled => return Ok(Fetched::Cancelled),
            }
        }
        Ok(Fetched::Bytes(kept))
    }

    /// Waits for the next payload bytes, at most the stall timeout.
    async fn next_chunk(
        &mut self,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<Chunk, AgentError> {
        let timeout = self.settings.payload_timeout;
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Chunk::Cancelled),
            read = self.link.read_chunk(buf, timeout) => read,
        };

        match read {
            Ok(0) => Err(LinkError::Closed.into()),
            Ok(n) => Ok(Chunk::Data(n)),
            Err(LinkError::Timeout) => Ok(Chunk::Stalled),
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_run(&mut self, cancel: &CancellationToken) -> Result<(), AgentError> {
        let Some(config) = self.state.config.clone() else {
            warn!("RUN received but no config present");
            return self.reply(Reply::error(ErrorKind::NoConfig)).await;
        };

        let deploy_dir = resolve_deploy_dir(config.directory.as_deref(), &self.settings.app_dir);
        let entry = match resolve_entry_point(&deploy_dir, &config.main) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "cannot run");
                return self
                    .reply(Reply::error_with(ErrorKind::Run, e.to_string()))
                    .await;
            }
        };

        let spec = match process_spec(&config, entry, deploy_dir) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(error = %e, "cannot prepare entry point");
                return self
                    .reply(Reply::error_with(ErrorKind::Run, e.to_string()))
                    .await;
            }
        };

        let result = stream_process(&mut self.link, &spec, cancel).await?;
        debug!(?result, "run finished");
        Ok(())
    }

    async fn reply(&mut self, reply: Reply) -> Result<(), AgentError> {
        debug!(%reply, "reply");
        self.link.write_line(&reply.to_string()).await?;
        Ok(())
    }
}

/// Builds the command line: `interpreter... <entry> args...`, or the entry
/// point itself when no interpreter is configured.
fn process_spec(
    config: &DeploymentConfig,
    entry: PathBuf,
    cwd: PathBuf,
) -> Result<ProcessSpec, AgentError> {
    let user_args = config.args.iter().map(OsString::from);

    let spec = match config.interpreter.split_first() {
        Some((program, prefix)) => ProcessSpec {
            program: program.into(),
            args: prefix
                .iter()
                .map(OsString::from)
                .chain(std::iter::once(entry.into_os_string()))
                .chain(user_args)
                .collect(),
            cwd,
        },
        None => {
            set_executable(&entry)?;
            ProcessSpec {
                program: entry.into_os_string(),
                args: user_args.collect(),
                cwd,
            }
        }
    };
    Ok(spec)
}

/// Replaces `dir` with the contents of the verified archive at `staging`.
///
/// The archive is opened before the directory is cleared so a staging
/// file inside the deploy directory stays readable.
fn extract_into(staging: &Path, dir: &Path) -> Result<usize, AgentError> {
    let archive = File::open(staging)?;
    replace_directory(dir)?;
    Ok(unpack_from(BufReader::new(archive), dir)?)
}

/// Creates (or truncates) the staging file, along with its directory.
async fn open_staging(staging: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = staging.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(staging).await
}

async fn discard(staging: &Path) {
    if let Err(e) = tokio::fs::remove_file(staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %staging.display(), error = %e, "failed to remove staging archive");
        }
    }
}
