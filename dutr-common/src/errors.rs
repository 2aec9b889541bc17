//! Error catalog for the DUT remote agent.
//!
//! Every failure that can cross the RPC boundary has a variant here with
//! a stable JSON-RPC error code. Asynchronous failures (callback retries
//! exhausted, sink degradation, transfer timeout after the reply already
//! went out) are logged at their origin and never fail the originating
//! RPC retroactively.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC 2.0 standard code for malformed requests.
pub const CODE_PARSE_ERROR: i64 = -32700;
/// JSON-RPC 2.0 standard code for an unknown method.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC 2.0 standard code for bad positional parameters.
pub const CODE_INVALID_PARAMS: i64 = -32602;

/// Errors raised by the agent core.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Registry miss: no job with this id (never created, already
    /// collected via GetJobResult, or removed by StopJob).
    #[error("no job with id {0}")]
    InvalidJobId(u64),

    /// Result or exit code requested while the child is still running.
    #[error("job {0} has not finished")]
    JobNotFinished(u64),

    /// StopJob on a job that already reached a terminal state.
    #[error("job {0} has already finished")]
    JobAlreadyFinished(u64),

    /// The child process could not be started.
    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Filesystem accessibility check failed before a transfer.
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// No peer connected to the transfer listener within the window.
    #[error("no transfer peer within {0:?}")]
    TransferTimeout(Duration),

    /// Tar parse failure, byte-count mismatch, port collision, or any
    /// other violation of the transfer protocol.
    #[error("transfer protocol error: {0}")]
    TransferProtocol(String),

    /// Writing the backup log failed; line delivery stopped.
    #[error("backup sink write failed: {0}")]
    SinkFailure(String),

    /// Completion endpoint never accepted a connection.
    #[error("completion endpoint {endpoint} unreachable after {attempts} attempts")]
    CallbackUnreachable { endpoint: SocketAddr, attempts: u32 },

    /// A plugin identifier was registered twice. The registry is a set.
    #[error("plugin `{0}` is already registered")]
    PluginConflict(String),

    /// No plugin registered under this identifier.
    #[error("no plugin named `{0}`")]
    PluginMissing(String),

    /// Operation only meaningful on Windows (elevation probe).
    #[error("operation is not supported on this platform")]
    PlatformUnsupported,

    /// Malformed RPC parameters.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Unknown RPC method name.
    #[error("unknown method `{0}`")]
    MethodNotFound(String),

    /// Anything else from the OS.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Stable JSON-RPC error code for this kind.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::InvalidJobId(_) => -32001,
            Self::JobNotFinished(_) => -32002,
            Self::JobAlreadyFinished(_) => -32003,
            Self::SpawnFailed { .. } => -32004,
            Self::PermissionDenied(_) => -32005,
            Self::TransferTimeout(_) => -32006,
            Self::TransferProtocol(_) => -32007,
            Self::SinkFailure(_) => -32008,
            Self::CallbackUnreachable { .. } => -32009,
            Self::PluginConflict(_) => -32010,
            Self::PluginMissing(_) => -32011,
            Self::PlatformUnsupported => -32012,
            Self::Io(_) => -32013,
            Self::InvalidParams(_) => CODE_INVALID_PARAMS,
            Self::MethodNotFound(_) => CODE_METHOD_NOT_FOUND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let errors: Vec<AgentError> = vec![
            AgentError::InvalidJobId(1),
            AgentError::JobNotFinished(1),
            AgentError::JobAlreadyFinished(1),
            AgentError::PermissionDenied(PathBuf::from("/x")),
            AgentError::TransferTimeout(Duration::from_secs(10)),
            AgentError::TransferProtocol("x".into()),
            AgentError::SinkFailure("x".into()),
            AgentError::PluginConflict("p".into()),
            AgentError::PluginMissing("p".into()),
            AgentError::PlatformUnsupported,
            AgentError::InvalidParams("x".into()),
            AgentError::MethodNotFound("x".into()),
        ];
        let mut codes: Vec<i64> = errors.iter().map(AgentError::rpc_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn display_names_the_job() {
        let err = AgentError::InvalidJobId(42);
        assert!(err.to_string().contains("42"));
    }
}
