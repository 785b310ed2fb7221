//! ---
//! ems_section: "02-decode-pipeline"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error types for decoding and register transports."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use bmsmon_common::Protocol;
use thiserror::Error;

/// Register blocks that do not satisfy the layout of their protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{protocol} main block holds {actual} registers, expected at least {expected}")]
    ShortBlock {
        protocol: Protocol,
        expected: usize,
        actual: usize,
    },
    #[error("{protocol} cell block holds {actual} registers, expected exactly {expected}")]
    CellBlockLength {
        protocol: Protocol,
        expected: usize,
        actual: usize,
    },
}

/// Failures raised by a [`crate::RegisterTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("connection to {endpoint} failed: {reason}")]
    Connect { endpoint: String, reason: String },
    #[error("read of {count} registers at offset {offset} failed: {reason}")]
    Read {
        offset: u16,
        count: u16,
        reason: String,
    },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that turns a poll cycle into an offline snapshot.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}
