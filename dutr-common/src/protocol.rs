//! Wire protocol definitions.
//!
//! Clients speak JSON-RPC 2.0 over line-delimited TCP: a single-line
//! request terminated by `\r\n`, a single-line response, then the
//! connection closes. Parameters are positional only. Discovery is a
//! separate UDP exchange, and the job callback/progress payloads are
//! plain ASCII/UTF-8 on fresh TCP connections.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::AgentError;

/// Payload a discovery client broadcasts to find agents.
pub const DISCOVERY_PING: &[u8] = b"SimpleJsonRpc Ping";

/// Prefix of backup log file names written to the system temp directory.
pub const BACKUP_LOG_PREFIX: &str = "SimpleRemote-JobOutput-";

/// RPC method names. Contract-stable.
pub mod methods {
    pub const START_JOB: &str = "StartJob";
    pub const START_JOB_WITH_NOTIFICATION: &str = "StartJobWithNotification";
    pub const START_JOB_WITH_PROGRESS: &str = "StartJobWithProgress";
    pub const IS_JOB_COMPLETE: &str = "IsJobComplete";
    pub const STOP_JOB: &str = "StopJob";
    pub const GET_JOB_RESULT: &str = "GetJobResult";
    pub const GET_ALL_JOBS: &str = "GetAllJobs";
    pub const RUN: &str = "Run";
    pub const RUN_WITH_RESULT: &str = "RunWithResult";
    pub const KILL_PROCESS: &str = "KillProcess";
    pub const UPLOAD: &str = "Upload";
    pub const DOWNLOAD: &str = "Download";
    pub const GET_VERSION: &str = "GetVersion";
    pub const GET_HEARTBEAT: &str = "GetHeartbeat";
    pub const GET_CLIENT_IP: &str = "GetClientIP";
}

/// ASCII payload sent on a fresh TCP connection to the completion
/// endpoint. No trailing newline.
pub fn completion_payload(job_id: u64) -> String {
    format!("JOB {job_id} COMPLETED")
}

/// Parse a completion payload back into a job id.
pub fn parse_completion_payload(payload: &str) -> Option<u64> {
    let rest = payload.strip_prefix("JOB ")?;
    let id = rest.strip_suffix(" COMPLETED")?;
    id.parse().ok()
}

/// Backup log file name for a job started at `stamp` (ISO 8601 with
/// colons flattened so the name is valid on every filesystem).
pub fn backup_log_name(stamp: &chrono::DateTime<chrono::Local>) -> String {
    format!(
        "{}{}.txt",
        BACKUP_LOG_PREFIX,
        stamp.format("%Y-%m-%dT%H-%M-%S%.3f")
    )
}

/// A single JSON-RPC 2.0 request line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    /// Positional parameters only.
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            id: Value::from(id),
        }
    }
}

/// A single JSON-RPC 2.0 response line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
    #[serde(default)]
    pub id: Value,
}

/// Error object inside a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, err: &AgentError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcErrorBody {
                code: err.rpc_code(),
                message: err.to_string(),
            }),
            id,
        }
    }

    /// Convert back into a result, for the client side.
    pub fn into_result(self) -> Result<Value, RpcErrorBody> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(err),
            (Some(value), None) => Ok(value),
            (None, None) => Ok(Value::Null),
        }
    }
}
