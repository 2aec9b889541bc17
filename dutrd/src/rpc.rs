//! JSON-RPC boundary.
//!
//! One request per connection: the client sends a single `\r\n`
//! terminated JSON line, gets a single response line back, and the
//! connection closes. Parameters are positional. Handlers keep no
//! per-connection state; everything durable lives in the job registry
//! or in a per-call transfer session.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use dutr_common::AgentError;
use dutr_common::config::{AgentConfig, NETWORK_TIMEOUT};
use dutr_common::errors::CODE_PARSE_ERROR;
use dutr_common::protocol::{RpcErrorBody, RpcRequest, RpcResponse, methods};
use dutr_common::types::Endpoint;

use crate::exec;
use crate::job::registry::JobRegistry;
use crate::job::{Job, JobSpec};
use crate::plugins::PluginRegistry;
use crate::transfer;

/// Shared state handed to every connection task.
pub struct AgentContext {
    pub registry: JobRegistry,
    pub plugins: PluginRegistry,
    pub config: AgentConfig,
    pub version: &'static str,
}

impl AgentContext {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            registry: JobRegistry::new(),
            plugins: PluginRegistry::new(),
            config,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Accept loop: one task per inbound RPC connection.
pub async fn serve(listener: TcpListener, ctx: Arc<AgentContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, ctx).await {
                        warn!(%err, "rpc connection error");
                    }
                });
            }
            Err(err) => {
                warn!(%err, "rpc accept error");
            }
        }
    }
}

/// Serve exactly one request on `stream`, then close.
pub async fn handle_connection(
    mut stream: TcpStream,
    ctx: Arc<AgentContext>,
) -> std::io::Result<()> {
    let peer = stream.peer_addr()?;
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    tokio::time::timeout(NETWORK_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "request read timed out"))??;

    let response = match serde_json::from_str::<RpcRequest>(line.trim_end()) {
        Ok(request) => {
            debug!(%peer, method = %request.method, "rpc request");
            let id = request.id.clone();
            match dispatch(&request, peer, &ctx).await {
                Ok(result) => RpcResponse::success(id, result),
                Err(err) => {
                    warn!(%peer, method = %request.method, %err, "rpc request failed");
                    RpcResponse::failure(id, &err)
                }
            }
        }
        Err(err) => RpcResponse {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(RpcErrorBody {
                code: CODE_PARSE_ERROR,
                message: format!("parse error: {err}"),
            }),
            id: Value::Null,
        },
    };

    let mut wire = serde_json::to_string(&response)?;
    wire.push_str("\r\n");
    write_half.write_all(wire.as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}

/// Route one request to its handler.
pub async fn dispatch(
    request: &RpcRequest,
    peer: SocketAddr,
    ctx: &AgentContext,
) -> Result<Value, AgentError> {
    let params = &request.params;
    match request.method.as_str() {
        methods::START_JOB => {
            let spec = JobSpec {
                program: param_str(params, 0, "programName")?,
                args: param_opt_str(params, 1),
                completion: None,
                progress: None,
            };
            start_tracked_job(ctx, spec).await
        }
        methods::START_JOB_WITH_NOTIFICATION => {
            let address = param_str(params, 0, "callbackAddress")?;
            let port = param_i32(params, 1, "callbackPort")?;
            let spec = JobSpec {
                program: param_str(params, 2, "programName")?,
                args: param_opt_str(params, 3),
                completion: resolve_endpoint(&address, port, peer)?,
                progress: None,
            };
            start_tracked_job(ctx, spec).await
        }
        methods::START_JOB_WITH_PROGRESS => {
            let address = param_str(params, 0, "callbackAddress")?;
            let callback_port = param_i32(params, 1, "callbackPort")?;
            let progress_port = param_i32(params, 2, "progressPort")?;
            let spec = JobSpec {
                program: param_str(params, 3, "programName")?,
                args: param_opt_str(params, 4),
                completion: resolve_endpoint(&address, callback_port, peer)?,
                progress: resolve_endpoint(&address, progress_port, peer)?,
            };
            start_tracked_job(ctx, spec).await
        }
        methods::IS_JOB_COMPLETE => {
            let id = param_u64(params, 0, "jobId")?;
            let job = ctx
                .registry
                .get(id)
                .await
                .ok_or(AgentError::InvalidJobId(id))?;
            Ok(json!(job.is_done()))
        }
        methods::STOP_JOB => {
            let id = param_u64(params, 0, "jobId")?;
            ctx.registry.stop(id).await?;
            Ok(json!(true))
        }
        methods::GET_JOB_RESULT => {
            let id = param_u64(params, 0, "jobId")?;
            let job = ctx
                .registry
                .get(id)
                .await
                .ok_or(AgentError::InvalidJobId(id))?;
            let text = job.result().await?;
            ctx.registry.remove(id).await;
            Ok(json!(text))
        }
        methods::GET_ALL_JOBS => {
            let snapshot = ctx.registry.snapshot().await;
            let mut map = serde_json::Map::new();
            for (id, done) in snapshot {
                map.insert(id.to_string(), json!(done));
            }
            Ok(Value::Object(map))
        }
        methods::RUN => {
            let program = param_str(params, 0, "programName")?;
            let args = param_opt_str(params, 1);
            exec::run_detached(&program, args.as_deref())?;
            Ok(json!(true))
        }
        methods::RUN_WITH_RESULT => {
            let program = param_str(params, 0, "programName")?;
            let args = param_opt_str(params, 1);
            let output = exec::run_with_result(&program, args.as_deref()).await?;
            Ok(json!(output))
        }
        methods::KILL_PROCESS => {
            let name = param_str(params, 0, "processName")?;
            exec::kill_by_name(&name).await?;
            Ok(json!(true))
        }
        methods::UPLOAD => {
            let path = param_str(params, 0, "path")?;
            let overwrite = param_bool(params, 1, "overwrite")?;
            let port = param_opt_port(params, 2)?;
            let bound = transfer::start_upload(&ctx.config.bind_address, path, overwrite, port).await?;
            Ok(json!(bound))
        }
        methods::DOWNLOAD => {
            let path = param_str(params, 0, "path")?;
            let port = param_opt_port(params, 1)?;
            let (bound, total) =
                transfer::start_download(&ctx.config.bind_address, path, port).await?;
            Ok(json!([bound, total]))
        }
        methods::GET_VERSION => Ok(json!(ctx.version)),
        methods::GET_HEARTBEAT => Ok(json!(true)),
        methods::GET_CLIENT_IP => Ok(json!(peer.ip().to_string())),
        other => Err(AgentError::MethodNotFound(other.to_string())),
    }
}

async fn start_tracked_job(ctx: &AgentContext, spec: JobSpec) -> Result<Value, AgentError> {
    let id = ctx.registry.allocate_id();
    let job = Job::spawn(id, spec).await?;
    ctx.registry.insert(job).await;
    Ok(json!(id))
}

/// Turn a `(address, port)` parameter pair into a socket address,
/// substituting the caller's own address when the field is empty. A
/// non-positive port disables the endpoint.
fn resolve_endpoint(
    address: &str,
    port: i32,
    peer: SocketAddr,
) -> Result<Option<SocketAddr>, AgentError> {
    let endpoint = Endpoint::new(address, port);
    if !endpoint.is_enabled() {
        return Ok(None);
    }
    endpoint
        .resolve(peer.ip())
        .map(Some)
        .ok_or_else(|| AgentError::InvalidParams(format!("bad callback address `{address}`")))
}

// ── Positional parameter extraction ──────────────────────────────────────

fn param_str(params: &[Value], idx: usize, name: &str) -> Result<String, AgentError> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AgentError::InvalidParams(format!("{name} (param {idx}) must be a string")))
}

fn param_opt_str(params: &[Value], idx: usize) -> Option<String> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn param_u64(params: &[Value], idx: usize, name: &str) -> Result<u64, AgentError> {
    params
        .get(idx)
        .and_then(Value::as_u64)
        .ok_or_else(|| AgentError::InvalidParams(format!("{name} (param {idx}) must be an id")))
}

fn param_i32(params: &[Value], idx: usize, name: &str) -> Result<i32, AgentError> {
    params
        .get(idx)
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| AgentError::InvalidParams(format!("{name} (param {idx}) must be a port")))
}

fn param_bool(params: &[Value], idx: usize, name: &str) -> Result<bool, AgentError> {
    params
        .get(idx)
        .and_then(Value::as_bool)
        .ok_or_else(|| AgentError::InvalidParams(format!("{name} (param {idx}) must be a bool")))
}

/// Optional requested port: absent or null means "let the OS pick".
fn param_opt_port(params: &[Value], idx: usize) -> Result<u16, AgentError> {
    match params.get(idx) {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| AgentError::InvalidParams(format!("param {idx} must be a port"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx() -> AgentContext {
        AgentContext::new(AgentConfig {
            bind_address: "127.0.0.1".to_string(),
            ..AgentConfig::default()
        })
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn heartbeat_is_true() {
        let ctx = test_ctx();
        let req = RpcRequest::new(methods::GET_HEARTBEAT, vec![], 1);
        assert_eq!(dispatch(&req, peer(), &ctx).await.unwrap(), json!(true));
    }

    #[tokio::test]
    async fn client_ip_reflects_peer() {
        let ctx = test_ctx();
        let req = RpcRequest::new(methods::GET_CLIENT_IP, vec![], 1);
        assert_eq!(
            dispatch(&req, peer(), &ctx).await.unwrap(),
            json!("127.0.0.1")
        );
    }

    #[tokio::test]
    async fn version_matches_crate() {
        let ctx = test_ctx();
        let req = RpcRequest::new(methods::GET_VERSION, vec![], 1);
        assert_eq!(
            dispatch(&req, peer(), &ctx).await.unwrap(),
            json!(env!("CARGO_PKG_VERSION"))
        );
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let ctx = test_ctx();
        let req = RpcRequest::new("NoSuchThing", vec![], 1);
        assert!(matches!(
            dispatch(&req, peer(), &ctx).await,
            Err(AgentError::MethodNotFound(_))
        ));
    }

    #[tokio::test]
    async fn start_job_and_collect_result() {
        let ctx = test_ctx();
        let req = RpcRequest::new(
            methods::START_JOB,
            vec![json!("echo"), json!("from-rpc")],
            1,
        );
        let id = dispatch(&req, peer(), &ctx).await.unwrap();
        let id_num = id.as_u64().unwrap();
        assert!(id_num >= 1);

        // Poll completion.
        let poll = RpcRequest::new(methods::IS_JOB_COMPLETE, vec![id.clone()], 2);
        for _ in 0..200 {
            if dispatch(&poll, peer(), &ctx).await.unwrap() == json!(true) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let get = RpcRequest::new(methods::GET_JOB_RESULT, vec![id.clone()], 3);
        let text = dispatch(&get, peer(), &ctx).await.unwrap();
        assert_eq!(text, json!("from-rpc\n"));

        // Collected jobs disappear from the registry.
        assert!(matches!(
            dispatch(&poll, peer(), &ctx).await,
            Err(AgentError::InvalidJobId(_))
        ));
    }

    #[tokio::test]
    async fn get_all_jobs_snapshots_every_start() {
        let ctx = test_ctx();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let req = RpcRequest::new(methods::START_JOB, vec![json!("echo"), json!("x")], 1);
            ids.push(
                dispatch(&req, peer(), &ctx)
                    .await
                    .unwrap()
                    .as_u64()
                    .unwrap(),
            );
        }
        let req = RpcRequest::new(methods::GET_ALL_JOBS, vec![], 2);
        let snapshot = dispatch(&req, peer(), &ctx).await.unwrap();
        let map = snapshot.as_object().unwrap();
        for id in ids {
            assert!(map.contains_key(&id.to_string()));
        }
    }

    #[tokio::test]
    async fn bad_params_are_rejected() {
        let ctx = test_ctx();
        let req = RpcRequest::new(methods::START_JOB, vec![json!(42)], 1);
        assert!(matches!(
            dispatch(&req, peer(), &ctx).await,
            Err(AgentError::InvalidParams(_))
        ));
    }

    #[test]
    fn endpoint_resolution_substitutes_caller() {
        let resolved = resolve_endpoint("", 9000, peer()).unwrap().unwrap();
        assert_eq!(resolved, "127.0.0.1:9000".parse().unwrap());
        assert!(resolve_endpoint("", 0, peer()).unwrap().is_none());
        assert!(resolve_endpoint("", -1, peer()).unwrap().is_none());
        assert!(resolve_endpoint("bogus!", 9000, peer()).is_err());
    }
}
