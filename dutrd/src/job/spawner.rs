//! Child process startup and termination.
//!
//! Programs are launched with stdout and stderr piped so the line pump
//! can drain them. A program path ending in `.ps1` is transparently
//! rewritten to run under the PowerShell host with script execution
//! allowed; everything else runs directly, no shell in between.

use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

use dutr_common::AgentError;
use dutr_common::util::split_arguments;

/// Suffix that triggers the scripting-host rewrite.
const SCRIPT_SUFFIX: &str = ".ps1";

/// A freshly spawned child with both output pipes taken.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    /// Human-readable command line, used for logs and the backup header.
    pub command_line: String,
}

/// Compose the display command line from program and optional args.
pub fn command_line(program: &str, args: Option<&str>) -> String {
    match args {
        Some(args) if !args.is_empty() => format!("{program} {args}"),
        _ => program.to_string(),
    }
}

/// Start `program` with the composed argument string.
///
/// Spawn failures surface synchronously as `SpawnFailed`. On Unix the
/// child gets its own process group so `kill_group` can take down the
/// whole tree.
pub fn spawn(program: &str, args: Option<&str>) -> Result<SpawnedProcess, AgentError> {
    let display_line = command_line(program, args);
    let arg_list = args.map(split_arguments).unwrap_or_default();

    let mut command = if program.to_ascii_lowercase().ends_with(SCRIPT_SUFFIX) {
        let mut c = Command::new(script_host());
        c.arg("-ExecutionPolicy")
            .arg("Bypass")
            .arg("-File")
            .arg(program)
            .args(&arg_list);
        c
    } else {
        let mut c = Command::new(program);
        c.args(&arg_list);
        c
    };

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| AgentError::SpawnFailed {
        command: display_line.clone(),
        source,
    })?;

    // Both pipes are always present with Stdio::piped; treat their
    // absence as a spawn failure rather than panicking.
    let stdout = child.stdout.take().ok_or_else(|| AgentError::SpawnFailed {
        command: display_line.clone(),
        source: std::io::Error::other("stdout pipe missing"),
    })?;
    let stderr = child.stderr.take().ok_or_else(|| AgentError::SpawnFailed {
        command: display_line.clone(),
        source: std::io::Error::other("stderr pipe missing"),
    })?;

    debug!(pid = ?child.id(), command = %display_line, "spawned child");

    Ok(SpawnedProcess {
        child,
        stdout,
        stderr,
        command_line: display_line,
    })
}

fn script_host() -> &'static str {
    if cfg!(windows) { "powershell.exe" } else { "pwsh" }
}

/// Force-terminate the child's whole process group.
///
/// On Unix the child was spawned as its own group leader, so a negative
/// pid kill reaches every descendant. The caller still awaits
/// `child.wait()` afterwards to reap. Elsewhere `start_kill` on the
/// handle is the only option and grandchildren are best-effort.
pub async fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let status = Command::new("kill")
            .arg("-KILL")
            .arg(format!("-{pid}"))
            .output()
            .await;
        match status {
            Ok(out) if out.status.success() => return,
            Ok(_) => debug!(pid, "group kill refused, falling back to direct kill"),
            Err(err) => debug!(pid, %err, "group kill unavailable, falling back"),
        }
    }

    if let Err(err) = child.start_kill() {
        debug!(%err, "start_kill failed (child may already be gone)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_composition() {
        assert_eq!(command_line("echo", Some("a b")), "echo a b");
        assert_eq!(command_line("echo", None), "echo");
        assert_eq!(command_line("echo", Some("")), "echo");
    }

    #[tokio::test]
    async fn spawn_missing_program_fails_synchronously() {
        let err = spawn("/nonexistent/binary-xyzzy", None).unwrap_err();
        assert!(matches!(err, AgentError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn spawn_and_wait_captures_exit_code() {
        let mut spawned = spawn("sh", Some("-c 'exit 3'")).unwrap();
        let status = spawned.child.wait().await.unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[tokio::test]
    async fn kill_group_terminates_sleeper() {
        let mut spawned = spawn("sleep", Some("30")).unwrap();
        kill_group(&mut spawned.child).await;
        let status = spawned.child.wait().await.unwrap();
        assert!(!status.success());
    }
}
