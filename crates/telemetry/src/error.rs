//! Error types shared by the collector and device sides.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

pub use crate::net::FormatError;

/// Socket-level failures. These end the loop or session that owns the socket, nothing else.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("send to {addr} failed: {source}")]
    SendFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] io::Error),

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
}

/// Rejected configuration values, reported before anything binds.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be within [0, 1], got {value}")]
    ProbabilityOutOfRange { name: &'static str, value: f64 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("initial retry timeout {initial_ms}ms exceeds the cap {cap_ms}ms")]
    BackoffInverted { initial_ms: u128, cap_ms: u128 },

    #[error("no device ids configured")]
    NoDevices,

    #[error("device id {0} listed more than once")]
    DuplicateDevice(u16),
}
