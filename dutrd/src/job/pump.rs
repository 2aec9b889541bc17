//! Line pump: merges the two child output pipes into one line channel.
//!
//! One reader task per pipe keeps the OS buffers drained so the child
//! never blocks on a full pipe. Lines from a single pipe stay in order;
//! interleaving between stdout and stderr is arbitrary. The channel is
//! unbounded: a slow sink buffers in process memory instead of stalling
//! the child, which is acceptable because the workloads this agent runs
//! produce bounded output.
//!
//! End-of-stream is signaled by channel closure: each reader drops its
//! sender at EOF, and once both are gone `recv()` returns `None`.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::trace;

/// Start draining both pipes. The returned receiver yields one line at
/// a time, newline stripped, until both pipes hit EOF.
pub fn start<O, E>(stdout: O, stderr: E) -> mpsc::UnboundedReceiver<String>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(read_lines(stdout, tx.clone(), "stdout"));
    tokio::spawn(read_lines(stderr, tx, "stderr"));
    rx
}

async fn read_lines<R>(pipe: R, tx: mpsc::UnboundedSender<String>, source: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    // Receiver dropped; keep draining so the child does
                    // not block on the pipe.
                    continue;
                }
            }
            Ok(None) => break,
            Err(err) => {
                trace!(source, %err, "pipe read ended with error");
                break;
            }
        }
    }
}
