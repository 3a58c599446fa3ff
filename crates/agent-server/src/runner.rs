//! Process streamer: runs the deployed entry point and relays its output.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use linkdeploy_protocol::{ErrorKind, Reply};
use linkdeploy_transport::{Link, LinkError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::OUTPUT_CHANNEL_SIZE;

/// What to launch for a `RUN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
}

impl ProcessSpec {
    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|s| s.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a `RUN` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// The process could not be started; `ERR_RUN` was sent.
    NotStarted(String),
    /// The process ended with this `EXIT` code (negative for a signal).
    Exited(i32),
    /// The exit status could not be collected; `ERR_STREAM` was sent.
    Abandoned(String),
    /// The agent shut down mid-run and killed the process, which ended
    /// with this `EXIT` code.
    Cancelled(i32),
}

enum Output {
    Line(&'static str, String),
    ReadFailed(&'static str, String),
}

/// Spawns `spec` and relays its merged stdout/stderr over `link`.
///
/// Replies `RUNNING` once the child is up, one line per output line, then
/// `EXIT <code>`. Holds the link until both pipes close and the child is
/// reaped. A failed write to the link stops relaying but the child is
/// still drained and reaped before the link error is returned.
///
/// When `cancel` fires the child is killed and reaped without waiting for
/// its pipes, which a surviving grandchild may still hold open.
pub async fn stream_process(
    link: &mut Link,
    spec: &ProcessSpec,
    cancel: &CancellationToken,
) -> Result<RunResult, LinkError> {
    info!(command = %spec.display(), cwd = %spec.cwd.display(), "starting process");

    let mut child = match Command::new(&spec.program)
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            let detail = format!("failed to start {}: {e}", spec.program.to_string_lossy());
            error!("{detail}");
            link.write_line(&Reply::error_with(ErrorKind::Run, detail.clone()).to_string())
                .await?;
            return Ok(RunResult::NotStarted(detail));
        }
    };

    link.write_line(&Reply::Running.to_string()).await?;

    let (tx, mut rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(stdout, "stdout", tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(stderr, "stderr", tx.clone()));
    }
    drop(tx);

    let mut link_error: Option<LinkError> = None;
    let mut cancelled = false;

    loop {
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            output = rx.recv() => match output {
                Some(output) => output,
                None => break,
            },
        };

        let line = match output {
            Output::Line(stream, line) => {
                info!(target: "app", stream, "{line}");
                Reply::Line(line).to_string()
            }
            Output::ReadFailed(stream, detail) => {
                warn!(stream, error = %detail, "failed to read process output");
                Reply::error_with(ErrorKind::Stream, detail).to_string()
            }
        };

        if link_error.is_none() {
            if let Err(e) = link.write_line(&line).await {
                warn!(error = %e, "link lost while streaming; draining process");
                link_error = Some(e);
            }
        }
    }

    if cancelled {
        info!("run cancelled; killing process");
        if let Err(e) = child.start_kill() {
            warn!(error = %e, "failed to kill process");
        }
    }

    let result = match child.wait().await {
        Ok(status) => {
            let code = exit_code(status);
            info!(code, "process exited");
            if cancelled {
                RunResult::Cancelled(code)
            } else {
                RunResult::Exited(code)
            }
        }
        Err(e) => {
            error!(error = %e, "failed to reap process");
            RunResult::Abandoned(e.to_string())
        }
    };

    if let Some(e) = link_error {
        return Err(e);
    }

    let reply = match &result {
        RunResult::Exited(code) | RunResult::Cancelled(code) => Reply::Exit(*code),
        RunResult::Abandoned(detail) | RunResult::NotStarted(detail) => {
            Reply::error_with(ErrorKind::Stream, detail.clone())
        }
    };
    link.write_line(&reply.to_string()).await?;

    Ok(result)
}

async fn forward_lines<R>(reader: R, stream: &'static str, tx: mpsc::Sender<Output>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(Output::Line(stream, line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Output::ReadFailed(stream, e.to_string())).await;
                break;
            }
        }
    }
}

/// Exit code, or the negated signal number for a killed process.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }

    -1
}
