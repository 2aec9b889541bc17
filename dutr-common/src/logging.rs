//! Logging bootstrap shared by the daemon and the client CLI.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// How the process wants its tracing subscriber configured.
#[derive(Debug, Clone)]
pub struct LogConfig {
    level: String,
    stderr: bool,
}

impl LogConfig {
    /// Start from `DUTR_LOG` if set, otherwise the given default level.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("DUTR_LOG").unwrap_or_else(|_| default_level.to_string());
        Self {
            level,
            stderr: false,
        }
    }

    /// Override the level (e.g. when a --verbose flag is set).
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    /// Write to stderr instead of stdout, keeping stdout clean for
    /// command output.
    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn level(&self) -> &str {
        &self.level
    }
}

/// Install the global tracing subscriber.
///
/// Returns an error if a subscriber is already installed (tests install
/// their own).
pub fn init_logging(config: &LogConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::new(config.level.clone());
    if config.stderr {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .try_init()
    }
}
