//! Job lifecycle: spawn, capture, route, notify.
//!
//! A job owns four tasks: a supervisor that arbitrates natural exit
//! against `Kill`, two pipe readers inside the line pump, a drain task
//! that moves pumped lines into the sink, and a short-lived callback
//! task. Completion ordering is explicit: the pump ends, the drain
//! finishes and closes the sinks, and only then does the completion
//! callback go out, so a client that reacts to the callback observes
//! fully flushed output.

pub mod pump;
pub mod registry;
pub mod sink;
pub mod spawner;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{Notify, watch};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use dutr_common::AgentError;
use dutr_common::config::{CALLBACK_ATTEMPTS, NETWORK_TIMEOUT};
use dutr_common::protocol::completion_payload;
use dutr_common::types::{JobState, SinkKind};

use sink::OutputSink;

/// Initial delay before the first completion-callback retry.
const CALLBACK_BACKOFF: Duration = Duration::from_secs(1);

/// What to launch and who to tell about it.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub program: String,
    pub args: Option<String>,
    /// Resolved completion endpoint, if notification was requested.
    pub completion: Option<SocketAddr>,
    /// Resolved progress endpoint, if live streaming was requested.
    pub progress: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: JobState,
    exit_code: i32,
}

/// A tracked child process.
pub struct Job {
    id: u64,
    command_line: String,
    sink_kind: SinkKind,
    backup_path: Option<PathBuf>,
    buffer: Arc<Mutex<String>>,
    status: watch::Receiver<Status>,
    drained: watch::Receiver<bool>,
    kill: Arc<Notify>,
}

impl Job {
    /// Spawn the child and wire up the pipeline.
    ///
    /// Fails synchronously when the program cannot start. When a
    /// progress endpoint is given, the outbound connect (bounded by the
    /// network timeout) happens here, so the sink mode is settled before
    /// this returns.
    pub async fn spawn(id: u64, spec: JobSpec) -> Result<Arc<Job>, AgentError> {
        let spawned = spawner::spawn(&spec.program, spec.args.as_deref())?;
        let spawner::SpawnedProcess {
            mut child,
            stdout,
            stderr,
            command_line,
        } = spawned;

        let buffer = Arc::new(Mutex::new(String::new()));
        let (mut sink, backup_path) =
            OutputSink::for_job(id, &command_line, spec.progress, buffer.clone()).await;
        let sink_kind = sink.kind();

        let mut lines = pump::start(stdout, stderr);

        let (status_tx, status_rx) = watch::channel(Status {
            state: JobState::Running,
            exit_code: 0,
        });
        let (drained_tx, drained_rx) = watch::channel(false);
        let kill = Arc::new(Notify::new());

        // Supervisor: owns the child, records the terminal state.
        let kill_signal = kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                res = child.wait() => match res {
                    Ok(status) => Status {
                        state: JobState::Exited,
                        exit_code: status.code().unwrap_or(-1),
                    },
                    Err(err) => {
                        warn!(job_id = id, %err, "wait on child failed");
                        Status { state: JobState::Exited, exit_code: -1 }
                    }
                },
                _ = kill_signal.notified() => {
                    spawner::kill_group(&mut child).await;
                    let code = match child.wait().await {
                        Ok(status) => status.code().unwrap_or(-1),
                        Err(_) => -1,
                    };
                    Status { state: JobState::Killed, exit_code: code }
                }
            };
            info!(job_id = id, state = %status.state, code = status.exit_code, "job finished");
            let _ = status_tx.send(status);
        });

        // Drain: sole consumer of the pump and sole closer of the sink.
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                sink.write_line(&line).await;
            }
            sink.close().await;
            let _ = drained_tx.send(true);
        });

        // Callback: fires after exit AND drain, in that observation order.
        if let Some(endpoint) = spec.completion {
            let mut status = status_rx.clone();
            let mut drained = drained_rx.clone();
            tokio::spawn(async move {
                let exited = status.wait_for(|s| s.state.is_done()).await.is_ok();
                let flushed = drained.wait_for(|d| *d).await.is_ok();
                if exited && flushed {
                    send_completion(id, endpoint).await;
                }
            });
        }

        Ok(Arc::new(Job {
            id,
            command_line,
            sink_kind,
            backup_path,
            buffer,
            status: status_rx,
            drained: drained_rx,
            kill,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Sink mode chosen at creation. The live mode may have degraded to
    /// file-only since; the initial tag is what result retrieval keys on.
    pub fn sink_kind(&self) -> SinkKind {
        self.sink_kind
    }

    pub fn backup_path(&self) -> Option<&PathBuf> {
        self.backup_path.as_ref()
    }

    /// True once the child has exited or been killed, regardless of
    /// whether output has finished draining.
    pub fn is_done(&self) -> bool {
        self.status.borrow().state.is_done()
    }

    pub fn state(&self) -> JobState {
        self.status.borrow().state
    }

    /// Exit code; available only after the job is done.
    pub fn exit_code(&self) -> Result<i32, AgentError> {
        let status = *self.status.borrow();
        if !status.state.is_done() {
            return Err(AgentError::JobNotFinished(self.id));
        }
        Ok(status.exit_code)
    }

    /// Request termination of the child's process group. Returns
    /// immediately; completion is observed through `is_done`.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// Block until every captured line has reached its sink and the
    /// sink has been closed.
    pub async fn wait_drained(&self) {
        let mut drained = self.drained.clone();
        let _ = drained.wait_for(|d| *d).await;
    }

    /// Collect the job's buffered output.
    ///
    /// Fails while the child is running. Waits for the drain so bytes
    /// written after exit are never lost. In streaming or file-only mode
    /// the text went out of band and the result is empty.
    pub async fn result(&self) -> Result<String, AgentError> {
        if !self.is_done() {
            return Err(AgentError::JobNotFinished(self.id));
        }
        self.wait_drained().await;
        match self.sink_kind {
            SinkKind::InMemory => {
                let buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
                Ok(buf.clone())
            }
            _ => Ok(String::new()),
        }
    }
}

/// Deliver `JOB <id> COMPLETED` to the completion endpoint, retrying
/// with doubling backoff. Exhausted retries are logged; nothing else
/// can be done, the originating RPC returned long ago.
async fn send_completion(job_id: u64, endpoint: SocketAddr) {
    let mut delay = CALLBACK_BACKOFF;
    for attempt in 1..=CALLBACK_ATTEMPTS {
        match try_send_completion(job_id, endpoint).await {
            Ok(()) => {
                info!(job_id, %endpoint, attempt, "completion callback delivered");
                return;
            }
            Err(err) => {
                warn!(job_id, %endpoint, attempt, %err, "completion callback attempt failed");
            }
        }
        if attempt < CALLBACK_ATTEMPTS {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    let err = AgentError::CallbackUnreachable {
        endpoint,
        attempts: CALLBACK_ATTEMPTS,
    };
    error!(job_id, %err, "giving up on completion callback");
}

async fn try_send_completion(job_id: u64, endpoint: SocketAddr) -> std::io::Result<()> {
    let mut stream = tokio::time::timeout(NETWORK_TIMEOUT, TcpStream::connect(endpoint))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
    stream
        .write_all(completion_payload(job_id).as_bytes())
        .await?;
    stream.shutdown().await?;
    Ok(())
}
