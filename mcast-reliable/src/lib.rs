//! `mcast-reliable` — reliable delivery over lossy hardware multicast.
//!
//! # Architecture
//!
//! ```text
//!   caller buffer                                     caller buffer
//!  ┌──────────┐  UD multicast, psn in imm_data  ┌──────────────────┐
//!  │  Sender  │────────────────────────────────▶│ Receiver +       │
//!  │  (root)  │                                 │ Reassembly       │
//!  └────┬─────┘                                 └────────┬─────────┘
//!       │            ACK / NACK / DATA                   │
//!       │◀───────────────────────────────────────────────┘
//!  ┌────▼─────────────────────────────────────────────────┐
//!  │ Communicator: pool, window, pending queue, ack tree  │
//!  └────┬─────────────────────────────────────────────────┘
//!       │ McastTransport + ControlChannel
//!  ┌────▼──────┐
//!  │ Transport │  (hardware queue pairs, or the in-process SimFabric)
//!  └───────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`config`]     — tunables and their validation
//! - [`packet`]     — immediate-data psn encoding and the control codec
//! - [`pool`]       — descriptor arena and free pool
//! - [`window`]     — power-of-two receive window ring
//! - [`request`]    — collective requests and tree links
//! - [`state`]      — progress and round-state types
//! - [`transport`]  — collaborator traits the core is written against
//! - [`comm`]       — per-group communicator state
//! - [`sender`]     — send pipeline
//! - [`receiver`]   — receive-completion polling
//! - [`reassembly`] — packet classification and the pending queue
//! - [`reliable`]   — acknowledgment rounds, NACKs, drop detection
//! - [`bcast`]      — the broadcast driver and window recycle
//! - [`simulator`]  — lossy/reordering in-process fabric for testing
//! - [`error`]      — the crate error type

pub mod bcast;
pub mod comm;
pub mod config;
pub mod error;
pub mod packet;
pub mod pool;
pub mod reassembly;
pub mod receiver;
pub mod reliable;
pub mod request;
pub mod sender;
pub mod simulator;
pub mod state;
pub mod transport;
pub mod window;

/// Rank of a process within its multicast group.
pub type Rank = u32;

pub use comm::{CommStats, Communicator};
pub use config::{CommConfig, ConfigError};
pub use error::{McastError, Result};
pub use request::{CollRequest, Proto, TreeLinks};
pub use state::{Progress, RoundState};
pub use transport::{ControlChannel, GroupSetup, McastTransport, MemoryRegion};
