//! Agent configuration with environment overrides.
//!
//! Defaults are compiled in; any field can be overridden through a
//! `DUTR_`-prefixed environment variable. Parse failures are collected
//! rather than aborting on the first bad variable.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Timeout applied to control-plane network operations (progress
/// connect, completion callback connect, RPC request read).
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a transfer listener waits for its single peer.
pub const TRANSFER_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum completion-callback connect attempts (1 s initial delay,
/// doubling between attempts).
pub const CALLBACK_ATTEMPTS: u32 = 5;

/// Runtime configuration for the agent daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Address the RPC and discovery sockets bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port for the JSON-RPC server.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// UDP port for the broadcast discovery responder. 0 disables it.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            rpc_port: default_rpc_port(),
            discovery_port: default_discovery_port(),
            log_level: default_log_level(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_rpc_port() -> u16 {
    8000
}

fn default_discovery_port() -> u16 {
    8001
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Errors collected while reading `DUTR_` environment variables.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },
}

/// Type-safe environment variable parser with the `DUTR_` prefix.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: "DUTR_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> String {
        env::var(self.var_name(name)).unwrap_or_else(|_| default.to_string())
    }

    pub fn get_u16(&mut self, name: &str, default: u16) -> u16 {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => self.parse_u16(var_name, value, default),
            Err(_) => default,
        }
    }

    fn parse_u16(&mut self, var_name: String, value: String, default: u16) -> u16 {
        match value.parse::<u16>() {
            Ok(parsed) => parsed,
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "port number".to_string(),
                    value,
                });
                default
            }
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentConfig {
    /// Build a config from defaults plus `DUTR_` environment overrides.
    ///
    /// Unparseable variables fall back to their defaults; the collected
    /// errors are returned so the caller can log them.
    pub fn from_env() -> (Self, Vec<EnvError>) {
        let mut parser = EnvParser::new();
        let defaults = Self::default();
        let config = Self {
            bind_address: parser.get_string("BIND_ADDRESS", &defaults.bind_address),
            rpc_port: parser.get_u16("RPC_PORT", defaults.rpc_port),
            discovery_port: parser.get_u16("DISCOVERY_PORT", defaults.discovery_port),
            log_level: parser.get_string("LOG_LEVEL", &defaults.log_level),
        };
        (config, parser.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AgentConfig::default();
        assert_eq!(config.rpc_port, 8000);
        assert_eq!(config.discovery_port, 8001);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn env_parser_collects_bad_values() {
        let mut parser = EnvParser::new();
        let port = parser.parse_u16("DUTR_RPC_PORT".to_string(), "not-a-port".to_string(), 4242);
        assert_eq!(port, 4242);
        assert_eq!(parser.errors().len(), 1);
        assert!(parser.errors()[0].to_string().contains("DUTR_RPC_PORT"));
    }

    #[test]
    fn env_parser_accepts_valid_port() {
        let mut parser = EnvParser::new();
        let port = parser.parse_u16("DUTR_RPC_PORT".to_string(), "9100".to_string(), 4242);
        assert_eq!(port, 9100);
        assert!(parser.errors().is_empty());
    }

    #[test]
    fn timeouts_match_contract() {
        assert_eq!(NETWORK_TIMEOUT, Duration::from_secs(5));
        assert_eq!(TRANSFER_ACCEPT_TIMEOUT, Duration::from_secs(10));
        assert_eq!(CALLBACK_ATTEMPTS, 5);
    }
}
