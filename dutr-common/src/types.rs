//! Core data model for jobs, sinks, callbacks, and transfers.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Lifecycle state of a tracked job.
///
/// Transitions are `Running -> Exited` (natural termination) and
/// `Running -> Killed` (external stop). Both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Child process is still running.
    Running,
    /// Child exited on its own; exit code captured.
    Exited,
    /// Child was force-terminated via StopJob.
    Killed,
}

impl JobState {
    /// True once the state has left `Running`.
    pub fn is_done(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Destination policy for captured child output.
///
/// The tag may degrade `StreamingWithBackup -> FileOnly` when the
/// progress connection fails mid-run, never the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// No progress endpoint: lines accumulate in memory for GetJobResult.
    InMemory,
    /// Progress endpoint connected: lines go to the TCP stream and a
    /// backup log file.
    StreamingWithBackup,
    /// Progress endpoint configured but unreachable, or the stream died:
    /// backup log only.
    FileOnly,
}

/// State of a transfer session, for logging and tests. The direction
/// is carried by the operation itself: Upload sessions extract, Download
/// sessions stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Listening,
    Transferring,
    Done,
    TimedOut,
    Failed,
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listening => write!(f, "listening"),
            Self::Transferring => write!(f, "transferring"),
            Self::Done => write!(f, "done"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A client-owned callback target.
///
/// The address may be empty, in which case the agent substitutes the
/// address of the RPC connection that created the job. A zero or
/// negative port disables the endpoint entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host address; empty string means "use the caller's own address".
    #[serde(default)]
    pub address: String,
    /// TCP port; values <= 0 disable the endpoint.
    pub port: i32,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, port: i32) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Whether this endpoint is usable at all.
    pub fn is_enabled(&self) -> bool {
        self.port > 0
    }

    /// Resolve to a socket address, substituting `caller` for an empty
    /// address field. Returns `None` when the endpoint is disabled or the
    /// address does not parse.
    pub fn resolve(&self, caller: IpAddr) -> Option<SocketAddr> {
        if !self.is_enabled() {
            return None;
        }
        let port = u16::try_from(self.port).ok()?;
        let ip = if self.address.is_empty() {
            caller
        } else {
            self.address.parse().ok()?
        };
        Some(SocketAddr::new(ip, port))
    }
}
