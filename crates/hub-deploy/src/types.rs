//! Data types for the deploy flow.

use std::time::Duration;

use linkdeploy_protocol::constants::{ACK_TIMEOUT, RESULT_IDLE_TIMEOUT, RUN_OBSERVE_WINDOW};

use crate::retry::RetryPolicy;

/// Knobs for one deployment.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub retry: RetryPolicy,
    /// Wait budget for `OK_CONFIG` and `OK`.
    pub ack_timeout: Duration,
    /// Longest silence tolerated while waiting for `DONE`. Every
    /// `PROGRESS` line starts a fresh budget.
    pub result_idle_timeout: Duration,
    /// How long to relay output after `RUN`.
    pub observe_window: Duration,
    /// Quiet period used when discarding stale input before an attempt.
    pub settle: Duration,
    /// Send `RUN` after a successful upload.
    pub run: bool,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            ack_timeout: ACK_TIMEOUT,
            result_idle_timeout: RESULT_IDLE_TIMEOUT,
            observe_window: RUN_OBSERVE_WINDOW,
            settle: Duration::from_millis(50),
            run: true,
        }
    }
}

/// Progress event emitted during deployment.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployEvent {
    /// The project archive is ready.
    ArchiveBuilt {
        files: usize,
        size: u64,
        digest: String,
    },
    AttemptStarted { attempt: u32, max_attempts: u32 },
    /// The agent reported `received` of `total` payload bytes.
    Progress { received: u64, total: u64 },
    AttemptFailed { attempt: u32, reason: String },
    /// Waiting `delay` before attempt `next_attempt`.
    Retrying { next_attempt: u32, delay: Duration },
    /// The agent verified and unpacked the archive.
    Uploaded { attempt: u32 },
    /// The agent started the entry point.
    Running,
    /// One line of program output.
    Output { line: String },
    Exited { code: i32 },
    Completed,
    Failed { error: String },
}

/// What happened after `RUN` during the observation window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// `RUNNING` was seen.
    pub started: bool,
    /// `EXIT <code>` arrived within the window.
    pub exit_code: Option<i32>,
    /// An `ERR_*` line the agent sent instead of running.
    pub error: Option<String>,
    /// Output lines relayed during the window.
    pub output_lines: usize,
}

/// Result of a successful deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    /// Attempt number that succeeded (1-based).
    pub attempts: u32,
    pub size: u64,
    pub digest: String,
    /// `None` when `RUN` was not requested.
    pub run: Option<RunReport>,
}
