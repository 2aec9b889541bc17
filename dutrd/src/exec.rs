//! Untracked execution helpers: Run, RunWithResult, KillProcess.
//!
//! These bypass the job registry. `Run` detaches, `RunWithResult`
//! blocks the RPC until the child exits and hands back its merged
//! output, and `KillProcess` is a best-effort sweep by image name.

use tokio::process::Command;
use tracing::{debug, info, warn};

use dutr_common::AgentError;

use crate::job::{pump, spawner};

/// Fire and forget. The child is reaped in the background so it never
/// lingers as a zombie.
pub fn run_detached(program: &str, args: Option<&str>) -> Result<(), AgentError> {
    let spawned = spawner::spawn(program, args)?;
    let command = spawned.command_line.clone();
    let mut child = spawned.child;
    // Pipes are dropped here; a child that fills them would stall, but
    // fire-and-forget callers accept that trade.
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!(%command, code = ?status.code(), "detached child finished"),
            Err(err) => warn!(%command, %err, "failed to reap detached child"),
        }
    });
    Ok(())
}

/// Run to completion and return the merged stdout+stderr lines.
pub async fn run_with_result(program: &str, args: Option<&str>) -> Result<String, AgentError> {
    let spawned = spawner::spawn(program, args)?;
    let mut child = spawned.child;
    let mut lines = pump::start(spawned.stdout, spawned.stderr);

    let mut output = String::new();
    while let Some(line) = lines.recv().await {
        output.push_str(&line);
        output.push('\n');
    }
    let status = child.wait().await?;
    debug!(command = %spawned.command_line, code = ?status.code(), "blocking run finished");
    Ok(output)
}

/// Terminate every process whose image name matches. Best-effort: a
/// name that matches nothing still reports success.
pub async fn kill_by_name(process_name: &str) -> Result<(), AgentError> {
    if process_name.is_empty() {
        return Err(AgentError::InvalidParams(
            "process name must not be empty".to_string(),
        ));
    }

    let output = if cfg!(windows) {
        Command::new("taskkill")
            .args(["/F", "/IM", process_name])
            .output()
            .await?
    } else {
        Command::new("pkill")
            .args(["-KILL", "-x", process_name])
            .output()
            .await?
    };

    info!(
        process_name,
        matched = output.status.success(),
        "kill-by-name sweep done"
    );
    Ok(())
}
