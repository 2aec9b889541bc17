//! Client library for the DUT remote agent.
//!
//! Wraps the line-delimited JSON-RPC exchange, the callback listeners a
//! client hosts for job notifications, the client half of the tar
//! transfer protocols, and the UDP discovery probe.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader as StdBufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::debug;

use dutr_common::protocol::{
    DISCOVERY_PING, RpcRequest, RpcResponse, methods, parse_completion_payload,
};

/// A connection-per-call JSON-RPC client.
#[derive(Debug, Clone)]
pub struct RpcClient {
    host: String,
    port: u16,
    timeout: Duration,
    next_id: u64,
}

impl RpcClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(5),
            next_id: 1,
        }
    }

    /// Issue one call: fresh connection, one request line, one response
    /// line, close.
    pub async fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let request = RpcRequest::new(method, params, id);
        let mut line = serde_json::to_string(&request)?;
        line.push_str("\r\n");

        let mut stream =
            tokio::time::timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port)))
                .await
                .context("connect to agent timed out")??;
        stream.write_all(line.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut reply = String::new();
        tokio::time::timeout(self.timeout, reader.read_line(&mut reply))
            .await
            .context("agent reply timed out")??;

        let response: RpcResponse = serde_json::from_str(reply.trim_end())
            .with_context(|| format!("malformed agent reply: {reply:?}"))?;
        response
            .into_result()
            .map_err(|err| anyhow!("agent error {}: {}", err.code, err.message))
    }

    pub async fn start_job(&mut self, program: &str, args: Option<&str>) -> Result<u64> {
        let result = self
            .call(methods::START_JOB, vec![json!(program), json!(args)])
            .await?;
        as_job_id(&result)
    }

    pub async fn start_job_with_notification(
        &mut self,
        callback_address: &str,
        callback_port: i32,
        program: &str,
        args: Option<&str>,
    ) -> Result<u64> {
        let result = self
            .call(
                methods::START_JOB_WITH_NOTIFICATION,
                vec![
                    json!(callback_address),
                    json!(callback_port),
                    json!(program),
                    json!(args),
                ],
            )
            .await?;
        as_job_id(&result)
    }

    pub async fn start_job_with_progress(
        &mut self,
        callback_address: &str,
        callback_port: i32,
        progress_port: i32,
        program: &str,
        args: Option<&str>,
    ) -> Result<u64> {
        let result = self
            .call(
                methods::START_JOB_WITH_PROGRESS,
                vec![
                    json!(callback_address),
                    json!(callback_port),
                    json!(progress_port),
                    json!(program),
                    json!(args),
                ],
            )
            .await?;
        as_job_id(&result)
    }

    pub async fn is_job_complete(&mut self, job_id: u64) -> Result<bool> {
        let result = self
            .call(methods::IS_JOB_COMPLETE, vec![json!(job_id)])
            .await?;
        result
            .as_bool()
            .ok_or_else(|| anyhow!("expected bool, got {result}"))
    }

    pub async fn stop_job(&mut self, job_id: u64) -> Result<()> {
        self.call(methods::STOP_JOB, vec![json!(job_id)]).await?;
        Ok(())
    }

    pub async fn get_job_result(&mut self, job_id: u64) -> Result<String> {
        let result = self
            .call(methods::GET_JOB_RESULT, vec![json!(job_id)])
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("expected string, got {result}"))
    }

    pub async fn get_all_jobs(&mut self) -> Result<HashMap<u64, bool>> {
        let result = self.call(methods::GET_ALL_JOBS, vec![]).await?;
        let map = result
            .as_object()
            .ok_or_else(|| anyhow!("expected object, got {result}"))?;
        let mut jobs = HashMap::new();
        for (key, value) in map {
            let id: u64 = key.parse().context("non-numeric job id")?;
            jobs.insert(id, value.as_bool().unwrap_or(false));
        }
        Ok(jobs)
    }

    pub async fn run(&mut self, program: &str, args: Option<&str>) -> Result<()> {
        self.call(methods::RUN, vec![json!(program), json!(args)])
            .await?;
        Ok(())
    }

    pub async fn run_with_result(&mut self, program: &str, args: Option<&str>) -> Result<String> {
        let result = self
            .call(methods::RUN_WITH_RESULT, vec![json!(program), json!(args)])
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("expected string, got {result}"))
    }

    pub async fn kill_process(&mut self, process_name: &str) -> Result<()> {
        self.call(methods::KILL_PROCESS, vec![json!(process_name)])
            .await?;
        Ok(())
    }

    /// Open an upload session on the agent; returns the transfer port.
    pub async fn upload(&mut self, remote_dest: &str, overwrite: bool, port: u16) -> Result<u16> {
        let result = self
            .call(
                methods::UPLOAD,
                vec![json!(remote_dest), json!(overwrite), json!(port)],
            )
            .await?;
        let bound = result
            .as_u64()
            .ok_or_else(|| anyhow!("expected port, got {result}"))?;
        Ok(u16::try_from(bound)?)
    }

    /// Open a download session; returns `(transfer_port, byte_total)`.
    pub async fn download(&mut self, remote_path: &str, port: u16) -> Result<(u16, u64)> {
        let result = self
            .call(methods::DOWNLOAD, vec![json!(remote_path), json!(port)])
            .await?;
        let pair = result
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| anyhow!("expected [port, total], got {result}"))?;
        let bound = pair[0].as_u64().ok_or_else(|| anyhow!("bad port"))?;
        let total = pair[1].as_u64().ok_or_else(|| anyhow!("bad total"))?;
        Ok((u16::try_from(bound)?, total))
    }

    pub async fn get_version(&mut self) -> Result<String> {
        let result = self.call(methods::GET_VERSION, vec![]).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("expected string, got {result}"))
    }

    pub async fn get_heartbeat(&mut self) -> Result<bool> {
        let result = self.call(methods::GET_HEARTBEAT, vec![]).await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    pub async fn get_client_ip(&mut self) -> Result<String> {
        let result = self.call(methods::GET_CLIENT_IP, vec![]).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("expected string, got {result}"))
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

fn as_job_id(result: &Value) -> Result<u64> {
    result
        .as_u64()
        .filter(|id| *id > 0)
        .ok_or_else(|| anyhow!("expected job id, got {result}"))
}

// ── Callback listeners ───────────────────────────────────────────────────

/// Listener for job completion callbacks.
pub struct CompletionListener {
    listener: TcpListener,
}

impl CompletionListener {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept one connection and parse the `JOB <id> COMPLETED` payload.
    pub async fn accept_completion(&self, timeout: Duration) -> Result<u64> {
        let (mut stream, peer) = tokio::time::timeout(timeout, self.listener.accept())
            .await
            .context("no completion callback before timeout")??;
        debug!(%peer, "completion connection");
        let mut payload = String::new();
        stream.read_to_string(&mut payload).await?;
        parse_completion_payload(&payload)
            .ok_or_else(|| anyhow!("unexpected completion payload {payload:?}"))
    }
}

/// Listener that collects a job's streamed output lines.
pub struct ProgressListener {
    listener: TcpListener,
}

impl ProgressListener {
    pub async fn bind() -> Result<Self> {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        Ok(Self { listener })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self.listener.local_addr()?.port())
    }

    /// Accept one connection and read lines until the agent closes it,
    /// which happens when the job finishes.
    pub async fn collect(&self, timeout: Duration) -> Result<Vec<String>> {
        let (stream, peer) = tokio::time::timeout(timeout, self.listener.accept())
            .await
            .context("no progress connection before timeout")??;
        debug!(%peer, "progress connection");
        let mut reader = BufReader::new(stream);
        let mut lines = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                break;
            }
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        Ok(lines)
    }
}

// ── Transfer client halves ───────────────────────────────────────────────

/// Push `local_path` (file or directory) to an upload session and
/// return the byte count the agent acknowledged in its trailer.
pub async fn push_tar(host: &str, port: u16, local_path: &Path) -> Result<u64> {
    let name = local_path
        .file_name()
        .ok_or_else(|| anyhow!("path {} has no name", local_path.display()))?
        .to_string_lossy()
        .into_owned();
    let meta = std::fs::metadata(local_path)
        .with_context(|| format!("cannot read {}", local_path.display()))?;

    let stream = TcpStream::connect((host, port)).await?;
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    let local_path = local_path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<u64> {
        let mut builder = tar::Builder::new(&stream);
        if meta.is_dir() {
            builder.append_dir_all(&name, &local_path)?;
        } else {
            builder.append_path_with_name(&local_path, &name)?;
        }
        builder.finish()?;
        drop(builder);

        stream.shutdown(std::net::Shutdown::Write)?;

        let mut reader = StdBufReader::new(&stream);
        let mut trailer = String::new();
        reader.read_line(&mut trailer)?;
        let trailer = trailer.trim_end_matches(['\r', '\n']);
        trailer
            .parse()
            .with_context(|| format!("unparseable byte-count trailer {trailer:?}"))
    })
    .await?
}

/// Pull a download session's tar stream and unpack it under `dest`.
pub async fn pull_tar(host: &str, port: u16, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let stream = TcpStream::connect((host, port)).await?;
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut archive = tar::Archive::new(&stream);
        archive.unpack(&dest)?;
        Ok(())
    })
    .await?
}

// ── Discovery ────────────────────────────────────────────────────────────

/// Probe for an agent: send the discovery ping and decode the 4-byte
/// little-endian RPC port from the reply.
pub async fn discover(target: &str, discovery_port: u16, timeout: Duration) -> Result<(SocketAddr, u16)> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    socket
        .send_to(DISCOVERY_PING, (target, discovery_port))
        .await?;

    let mut buf = [0u8; 8];
    let (len, agent) = tokio::time::timeout(timeout, socket.recv_from(&mut buf))
        .await
        .context("no discovery reply")??;
    if len != 4 {
        bail!("discovery reply has {len} bytes, expected 4");
    }
    let port = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let port = u16::try_from(port).context("advertised port out of range")?;
    Ok((agent, port))
}
