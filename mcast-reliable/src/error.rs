//! Error types for the reliable multicast core.
//!
//! Only transport-fatal conditions ever reach the caller.  Backpressure (no
//! free buffer, full send queue) and packet loss are resolved by continued
//! polling and never show up here.

use thiserror::Error;

use crate::config::ConfigError;
use crate::packet::PacketError;
use crate::transport::{TransportError, WcStatus};

/// Errors surfaced by communicator operations.
#[derive(Error, Debug)]
pub enum McastError {
    /// A post or poll on the underlying queues failed.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// A work completion reported a non-success status.
    #[error("work completion {wr_id:#x} failed with status {status}")]
    Completion { status: WcStatus, wr_id: u64 },

    /// The communicator configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A control packet could not be decoded.
    #[error("malformed control packet: {0}")]
    Packet(#[from] PacketError),

    /// A data packet's length disagrees with its position in the request.
    #[error("psn {psn}: payload length {got} does not match expected {expected}")]
    LengthMismatch { psn: u32, expected: usize, got: usize },

    /// A receive completion names no posted receive buffer.
    #[error("receive completion {wr_id:#x} does not match a posted buffer")]
    UnknownWrId { wr_id: u64 },

    /// A receive completion is shorter than the routing header.
    #[error("receive completion of {byte_len} bytes is shorter than the routing header")]
    Truncated { byte_len: usize },

    /// The caller buffer cannot hold the payload described by the request.
    #[error("request buffer of {len} bytes cannot be registered with {mr_len} byte region")]
    RegionTooSmall { len: usize, mr_len: usize },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, McastError>;
