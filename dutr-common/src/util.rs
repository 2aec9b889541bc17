//! Shared utilities.

use crate::errors::AgentError;

/// Split a composed argument string into individual arguments.
///
/// Splits on whitespace, honoring single and double quotes with
/// backslash escapes, so `--name "hello world"` yields two arguments.
/// No shell is involved; globs and variable references pass through
/// literally.
pub fn split_arguments(args: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quote: Option<char> = None;
    let mut escaped = false;
    let mut has_token = false;

    for c in args.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            has_token = true;
            continue;
        }
        if let Some(q) = in_quote {
            if c == q {
                in_quote = None;
            } else {
                current.push(c);
            }
            continue;
        }
        if c == '"' || c == '\'' {
            in_quote = Some(c);
            has_token = true;
            continue;
        }
        if c.is_whitespace() {
            if has_token {
                out.push(std::mem::take(&mut current));
                has_token = false;
            }
            continue;
        }
        current.push(c);
        has_token = true;
    }
    if has_token {
        out.push(current);
    }
    out
}

/// Check whether the current process runs with administrator rights.
///
/// Only meaningful on Windows; everywhere else the caller gets
/// `PlatformUnsupported`, matching the agent's service heritage.
pub fn is_elevated() -> Result<bool, AgentError> {
    #[cfg(windows)]
    {
        // `net session` exits zero only in an elevated shell.
        let status = std::process::Command::new("net")
            .arg("session")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()?;
        Ok(status.success())
    }
    #[cfg(not(windows))]
    {
        Err(AgentError::PlatformUnsupported)
    }
}
