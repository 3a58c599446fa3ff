use std::time::Duration;

/// Default serial line speed.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Name of the deployment descriptor at the project root.
///
/// Always packed into the archive, regardless of include/exclude rules.
pub const DESCRIPTOR_NAME: &str = "config.json";

/// Name used for the archive on the wire and for the agent's staging file.
pub const ARCHIVE_NAME: &str = "__upload__.tar.gz";

/// Bytes between two `PROGRESS` lines during an upload (64 KiB).
pub const PROGRESS_INTERVAL: u64 = 64 * 1024;

/// Read/write granularity for payload bytes (16 KiB).
pub const PAYLOAD_CHUNK_SIZE: usize = 16 * 1024;

/// Largest CONFIG payload the agent accepts (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Longest header or reply line accepted on the link (64 KiB).
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Time the controller waits for `OK_CONFIG` or `OK`.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Time the controller waits without any line while awaiting `DONE`.
///
/// Each `PROGRESS` line restarts the budget.
pub const RESULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the controller relays live output after sending `RUN`.
pub const RUN_OBSERVE_WINDOW: Duration = Duration::from_secs(10);

/// Time the agent waits for the next payload byte before giving up.
pub const PAYLOAD_STALL_TIMEOUT: Duration = Duration::from_secs(30);
