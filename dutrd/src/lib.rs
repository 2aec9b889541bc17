//! DUT Remote Agent - daemon internals.
//!
//! The daemon accepts JSON-RPC requests over line-delimited TCP to
//! launch processes, stream their output, move file trees as tar
//! streams, and answer UDP discovery pings. Everything here is exposed
//! as a library so the integration tests can drive a real server over
//! loopback.

#![forbid(unsafe_code)]

pub mod discovery;
pub mod exec;
pub mod job;
pub mod plugins;
pub mod rpc;
pub mod transfer;
