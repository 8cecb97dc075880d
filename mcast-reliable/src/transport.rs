//! Interfaces to the collaborators outside the core.
//!
//! The core never talks to a device directly.  It needs three things, each
//! expressed as a trait:
//!
//! - [`McastTransport`] — the unreliable multicast queue pair: post sends and
//!   receive buffers, poll the two completion queues.
//! - [`ControlChannel`] — reliable point-to-point byte messages between ranks,
//!   used for ACK/NACK traffic and retransmitted payloads.
//! - [`GroupSetup`] — one-shot bring-up and teardown, called outside the
//!   progress loop.
//!
//! [`crate::simulator`] implements all three in-process.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use crate::Rank;

/// Work-request id used for multicast data sends.
pub const MCAST_BCASTSEND_WR: u64 = 1;

/// Completion status reported by a completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    WorkRequestFlushed,
    RetryExceeded,
    GeneralError,
}

impl fmt::Display for WcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WcStatus::Success => "success",
            WcStatus::LocalLengthError => "local length error",
            WcStatus::LocalProtectionError => "local protection error",
            WcStatus::WorkRequestFlushed => "work request flushed",
            WcStatus::RetryExceeded => "transport retry counter exceeded",
            WcStatus::GeneralError => "general error",
        };
        f.write_str(s)
    }
}

/// Handle of a registered memory region.
///
/// Registration itself happens outside the core; requests only carry the
/// local key and the registered length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub lkey: u32,
    pub len: usize,
}

impl MemoryRegion {
    pub fn new(lkey: u32, len: usize) -> Self {
        Self { lkey, len }
    }
}

/// One multicast send.
#[derive(Debug)]
pub struct SendWorkRequest<'a> {
    pub wr_id: u64,
    /// Immediate data, already in network byte order.
    pub imm_data: u32,
    pub payload: &'a [u8],
    pub lkey: u32,
    /// Copy the payload into the work queue entry.
    pub inline: bool,
    /// Generate a send completion for this request.
    pub signaled: bool,
}

/// A send completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
}

/// A receive completion queue entry.
///
/// `buf` is the buffer that was posted with `wr_id`, handed back to its
/// owner; the frame starts with the routing header.
#[derive(Debug)]
pub struct RecvCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    /// Bytes written, routing header included.
    pub byte_len: usize,
    /// Immediate data in network byte order.
    pub imm_data: u32,
    pub buf: Vec<u8>,
}

/// Failures of collaborator operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("post send failed (rc {0})")]
    PostSend(i32),
    #[error("post receive failed (rc {0})")]
    PostRecv(i32),
    #[error("completion queue poll failed (rc {0})")]
    PollCq(i32),
    #[error("inline payload of {len} bytes exceeds device limit {max}")]
    InlineTooLarge { len: usize, max: usize },
    #[error("peer rank {0} is unreachable")]
    Unreachable(Rank),
    #[error("no transport device matches {0:?}")]
    NoDevice(String),
    #[error("rank {0} is outside the group")]
    BadRank(Rank),
}

/// The unreliable multicast queue pair.
pub trait McastTransport {
    /// Post one send; the payload is consumed before this returns.
    fn post_send(&mut self, wr: &SendWorkRequest<'_>) -> Result<(), TransportError>;

    /// Post a batch of receive buffers, each tagged with its work-request id.
    fn post_recv(&mut self, wrs: Vec<(u64, Vec<u8>)>) -> Result<(), TransportError>;

    /// Drain up to `max` send completions.
    fn poll_send_cq(&mut self, max: usize) -> Result<Vec<SendCompletion>, TransportError>;

    /// Drain up to `max` receive completions.
    fn poll_recv_cq(&mut self, max: usize) -> Result<Vec<RecvCompletion>, TransportError>;
}

/// Reliable point-to-point messaging between ranks of the group.
pub trait ControlChannel {
    /// Queue `bytes` for delivery to `peer`.  Delivery is reliable and
    /// ordered per peer pair; the send completes immediately.
    fn send_to(&mut self, peer: Rank, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Next message addressed to this rank, if one has arrived.
    fn try_recv(&mut self) -> Result<Option<(Rank, Vec<u8>)>, TransportError>;
}

/// One-shot bring-up and teardown of a communicator's endpoint.
pub trait GroupSetup {
    type Endpoint: McastTransport + ControlChannel;

    /// Resolve the IP address of the fabric interface named in `devices`.
    fn probe_transport_address(&self, devices: &str) -> Result<IpAddr, TransportError>;

    /// Create the queue pairs and completion queues for `rank`.
    fn acquire_queue_pairs(&self, rank: Rank) -> Result<Self::Endpoint, TransportError>;

    /// Attach the endpoint to the multicast group.
    fn bring_up_multicast_group(
        &self,
        endpoint: &mut Self::Endpoint,
        group: IpAddr,
    ) -> Result<(), TransportError>;

    /// Detach from the group and release the endpoint's queues.
    fn teardown_communicator(&self, endpoint: Self::Endpoint) -> Result<(), TransportError>;
}
