//! Output routing: where captured child lines go.
//!
//! The sink is picked once at job creation. Without a progress endpoint
//! lines accumulate in memory for `GetJobResult`. With one, the agent
//! connects out and mirrors every line to the live stream and a backup
//! log under the system temp directory; if the connect fails the backup
//! log carries the output alone. A stream that dies mid-run downgrades
//! the sink in place; the backup file is the invariant copy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{error, info, warn};

use dutr_common::AgentError;
use dutr_common::config::NETWORK_TIMEOUT;
use dutr_common::protocol::backup_log_name;
use dutr_common::types::SinkKind;

/// Active sink for one job's output lines.
///
/// `Dead` means the backup file became unwritable; further lines are
/// discarded while the child keeps running.
pub enum OutputSink {
    Memory {
        buffer: Arc<Mutex<String>>,
    },
    Streaming {
        stream: TcpStream,
        file: File,
        path: PathBuf,
    },
    File {
        file: File,
        path: PathBuf,
    },
    Dead,
}

impl OutputSink {
    /// Build the sink for a job.
    ///
    /// Returns the sink plus the backup log path when one was created.
    /// The progress connect is bounded by the control-network timeout;
    /// a refused or slow endpoint lands in `FileOnly` mode.
    pub async fn for_job(
        job_id: u64,
        command_line: &str,
        progress: Option<SocketAddr>,
        buffer: Arc<Mutex<String>>,
    ) -> (OutputSink, Option<PathBuf>) {
        let Some(endpoint) = progress else {
            return (OutputSink::Memory { buffer }, None);
        };

        let (mut file, path) = match create_backup_log(job_id, command_line).await {
            Ok(pair) => pair,
            Err(err) => {
                error!(job_id, %err, "backup log creation failed, output will be dropped");
                return (OutputSink::Dead, None);
            }
        };

        match tokio::time::timeout(NETWORK_TIMEOUT, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => {
                info!(job_id, %endpoint, "streaming job output");
                (OutputSink::Streaming { stream, file, path: path.clone() }, Some(path))
            }
            Ok(Err(err)) => {
                warn!(job_id, %endpoint, %err, "progress connect failed, backup log only");
                (OutputSink::File { file, path: path.clone() }, Some(path))
            }
            Err(_) => {
                warn!(job_id, %endpoint, "progress connect timed out, backup log only");
                let _ = file.flush().await;
                (OutputSink::File { file, path: path.clone() }, Some(path))
            }
        }
    }

    /// Current mode tag.
    pub fn kind(&self) -> SinkKind {
        match self {
            Self::Memory { .. } => SinkKind::InMemory,
            Self::Streaming { .. } => SinkKind::StreamingWithBackup,
            Self::File { .. } | Self::Dead => SinkKind::FileOnly,
        }
    }

    /// Deliver one output line.
    ///
    /// Stream errors downgrade to file-only mode; the line that hit the
    /// error still reaches the backup file. A backup write error kills
    /// the sink and subsequent lines are dropped.
    pub async fn write_line(&mut self, line: &str) {
        if let Self::Streaming { stream, .. } = self {
            let mut record = Vec::with_capacity(line.len() + 1);
            record.extend_from_slice(line.as_bytes());
            record.push(b'\n');
            if let Err(err) = stream.write_all(&record).await {
                warn!(%err, "progress stream write failed, downgrading to backup log");
                self.after_stream_error();
            }
        }

        match self {
            Self::Memory { buffer } => {
                let mut buf = buffer.lock().unwrap_or_else(|e| e.into_inner());
                buf.push_str(line);
                buf.push('\n');
            }
            Self::Streaming { file, path, .. } | Self::File { file, path } => {
                let mut record = Vec::with_capacity(line.len() + 1);
                record.extend_from_slice(line.as_bytes());
                record.push(b'\n');
                if let Err(err) = file.write_all(&record).await {
                    let failure = AgentError::SinkFailure(err.to_string());
                    error!(path = %path.display(), %failure, "dropping further output");
                    *self = Self::Dead;
                }
            }
            Self::Dead => {}
        }
    }

    /// Single transition out of streaming mode. Dropping the stream
    /// closes the network half; the file and its path carry over.
    fn after_stream_error(&mut self) {
        let prev = std::mem::replace(self, Self::Dead);
        *self = match prev {
            Self::Streaming { stream, file, path } => {
                drop(stream);
                Self::File { file, path }
            }
            other => other,
        };
    }

    /// Flush and close whatever halves are still open. The progress
    /// stream ends with connection close, which is how the client learns
    /// the job is finished streaming.
    pub async fn close(&mut self) {
        match std::mem::replace(self, Self::Dead) {
            Self::Streaming { mut stream, mut file, .. } => {
                let _ = file.flush().await;
                let _ = stream.shutdown().await;
            }
            Self::File { mut file, .. } => {
                let _ = file.flush().await;
            }
            Self::Memory { buffer } => {
                // Nothing to flush; keep the variant so late callers can
                // still observe the mode.
                *self = Self::Memory { buffer };
            }
            Self::Dead => {}
        }
    }
}

/// Create the backup log and write its header: identity line, the
/// command line, then a blank separator.
async fn create_backup_log(
    job_id: u64,
    command_line: &str,
) -> std::io::Result<(File, PathBuf)> {
    let stamp = chrono::Local::now();
    let path = std::env::temp_dir().join(backup_log_name(&stamp));
    let mut file = File::create(&path).await?;
    let header = format!(
        "SimpleRemote Job {} Output - {}\n{}\n\n",
        job_id,
        stamp.format("%Y-%m-%d %H:%M:%S"),
        command_line,
    );
    file.write_all(header.as_bytes()).await?;
    Ok((file, path))
}
