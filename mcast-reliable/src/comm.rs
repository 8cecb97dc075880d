//! Per-group communicator state.
//!
//! A [`Communicator`] owns everything one multicast session touches: the
//! endpoint, the descriptor pool, the receive window, the pending queue and
//! the acknowledgment-tree counters.  Its operations are spread over the
//! modules that implement them:
//!
//! - [`crate::sender`]     — send pipeline and send-completion polling
//! - [`crate::receiver`]   — receive-completion polling
//! - [`crate::reassembly`] — packet classification and the pending queue
//! - [`crate::reliable`]   — acknowledgment rounds and NACK servicing
//! - [`crate::bcast`]      — the broadcast driver and window recycle
//!
//! All of them take `&mut self`; the communicator is driven from a single
//! progress context and needs no locking.

use std::collections::VecDeque;

use log::{debug, error, trace};

use crate::config::CommConfig;
use crate::error::{McastError, Result};
use crate::pool::{BufferPool, DescId, Membership};
use crate::reliable::{AckTree, DropDetector};
use crate::request::{CollRequest, Proto, TreeLinks};
use crate::state::RoundState;
use crate::transport::{ControlChannel, McastTransport, MemoryRegion};
use crate::window::ReceiveWindow;
use crate::Rank;

/// Counters kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommStats {
    /// Completed acknowledgment rounds.
    pub rounds: u64,
    /// NACKs this rank sent to a parent.
    pub nacks_sent: u64,
    /// Retransmissions this rank served to children.
    pub retransmits: u64,
    /// Duplicate or stale packets discarded.
    pub duplicates: u64,
    /// Multicast data packets posted.
    pub packets_sent: u64,
    /// Packets delivered into request buffers.
    pub packets_delivered: u64,
}

/// State of one rank in one multicast group.
pub struct Communicator<T> {
    pub(crate) rank: Rank,
    pub(crate) size: u32,
    pub(crate) comm_id: u32,
    pub(crate) config: CommConfig,
    pub(crate) transport: T,

    pub(crate) pool: BufferPool,
    pub(crate) window: ReceiveWindow,
    /// Arrived but undeliverable descriptors, in arrival order.
    pub(crate) pending_q: VecDeque<DescId>,

    /// Next psn to send (root) or to deliver (receivers).
    pub(crate) psn: u32,
    /// First psn of the next request created on this communicator.
    pub(crate) last_psn: u32,
    /// Everything below this psn is fully processed.
    pub(crate) last_acked: u32,

    /// Signaled sends whose completion has not been polled yet.
    pub(crate) pending_send: usize,
    /// Unsignaled sends since the last signaled one.
    pub(crate) tx: usize,
    /// Receive buffers currently posted.
    pub(crate) pending_recv: usize,

    pub(crate) tree: AckTree,
    pub(crate) drop: DropDetector,
    pub(crate) stats: CommStats,
}

impl<T> std::fmt::Debug for Communicator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("comm_id", &self.comm_id)
            .field("psn", &self.psn)
            .field("last_acked", &self.last_acked)
            .field("pending_q", &self.pending_q.len())
            .field("pending_send", &self.pending_send)
            .field("pending_recv", &self.pending_recv)
            .finish_non_exhaustive()
    }
}

impl<T> Communicator<T>
where
    T: McastTransport + ControlChannel,
{
    /// Build the communicator for `rank` of a `size`-rank group over an
    /// already brought-up endpoint.
    ///
    /// No receive buffers are posted yet; call [`Communicator::prepost`]
    /// before the first collective.
    pub fn new(rank: Rank, size: u32, comm_id: u32, config: CommConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let window = ReceiveWindow::new(config.wsize)?;
        let pool = BufferPool::new(config.buf_n, config.max_per_packet);
        debug!(
            "comm {comm_id}: rank {rank}/{size}, wsize {}, buf_n {}, max_per_packet {}",
            config.wsize, config.buf_n, config.max_per_packet
        );
        Ok(Self {
            rank,
            size,
            comm_id,
            config,
            transport,
            pool,
            window,
            pending_q: VecDeque::new(),
            psn: 0,
            last_psn: 0,
            last_acked: 0,
            pending_send: 0,
            tx: 0,
            pending_recv: 0,
            tree: AckTree::default(),
            drop: DropDetector::default(),
            stats: CommStats::default(),
        })
    }

    /// Fill the hardware receive queue.
    pub fn prepost(&mut self) -> Result<()> {
        self.post_recv_buffers()
    }

    /// Describe a broadcast of `buf` from `root` and reserve its psn range.
    ///
    /// `links` are this rank's neighbours in the request's acknowledgment
    /// tree.  The buffer stays borrowed until the request completes, which
    /// lets zero-copy sends alias it.
    pub fn init_bcast<'a>(
        &mut self,
        buf: &'a mut [u8],
        root: Rank,
        mr: MemoryRegion,
        links: TreeLinks,
    ) -> Result<CollRequest<'a>> {
        if mr.len < buf.len() {
            return Err(McastError::RegionTooSmall {
                len: buf.len(),
                mr_len: mr.len,
            });
        }
        let mpp = self.config.max_per_packet;
        let len = buf.len();
        let num_packets = len.div_ceil(mpp).max(1);
        let last_pkt_len = len - (num_packets - 1) * mpp;
        let num_packets = num_packets as u32;
        let start_psn = self.last_psn;
        self.last_psn = self.last_psn.wrapping_add(num_packets);

        let am_root = root == self.rank;
        let proto = if am_root && len >= self.config.zcopy_threshold {
            Proto::ZeroCopy
        } else {
            Proto::Staged
        };
        debug!(
            "comm {}: rank {} bcast root {root} len {len} psn [{start_psn}, +{num_packets}) {proto:?}",
            self.comm_id, self.rank
        );

        Ok(CollRequest {
            buf,
            offset: 0,
            start_psn,
            num_packets,
            to_send: if am_root { num_packets } else { 0 },
            to_recv: if am_root { 0 } else { num_packets },
            last_pkt_len,
            mr,
            root,
            am_root,
            proto,
            links,
            delivered: 0,
        })
    }

    /// Keep the receive queue topped up.
    ///
    /// Reposts only once the deficit exceeds `post_recv_thresh`, so buffers
    /// go back in batches.  Running out of free descriptors just posts
    /// fewer; a failed post is fatal.
    pub(crate) fn post_recv_buffers(&mut self) -> Result<()> {
        let count = self.config.rx_depth.saturating_sub(self.pending_recv);
        if count <= self.config.post_recv_thresh {
            return Ok(());
        }

        let mut wrs = Vec::with_capacity(count);
        while wrs.len() < count {
            let Some(id) = self.pool.acquire() else {
                break;
            };
            wrs.push((id.wr_id(), self.pool.lend(id)));
        }
        if wrs.is_empty() {
            return Ok(());
        }

        let posted = wrs.len();
        if let Err(e) = self.transport.post_recv(wrs) {
            error!("comm {}: failed to prepost {posted} recvs: {e}", self.comm_id);
            return Err(e.into());
        }
        self.pending_recv += posted;
        trace!(
            "comm {}: posted {posted} recv buffers, pending_recv {}",
            self.comm_id,
            self.pending_recv
        );
        Ok(())
    }

    /// Hand the endpoint back, e.g. for teardown.
    pub fn into_transport(self) -> T {
        self.transport
    }
}

impl<T> Communicator<T> {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn comm_id(&self) -> u32 {
        self.comm_id
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    /// Next psn to send or deliver.
    pub fn psn(&self) -> u32 {
        self.psn
    }

    pub fn last_acked(&self) -> u32 {
        self.last_acked
    }

    pub fn pending_send(&self) -> usize {
        self.pending_send
    }

    pub fn pending_recv(&self) -> usize {
        self.pending_recv
    }

    /// Descriptors waiting in the pending queue.
    pub fn pending_len(&self) -> usize {
        self.pending_q.len()
    }

    pub fn stats(&self) -> &CommStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Window slots not yet consumed by the current round.
    pub fn free_window(&self) -> usize {
        let used = self.psn.wrapping_sub(self.last_acked) as usize;
        self.config.wsize.saturating_sub(used)
    }

    pub fn racks_n(&self) -> usize {
        self.tree.racks_n
    }

    pub fn child_n(&self) -> usize {
        self.tree.children.len()
    }

    pub fn sacks_n(&self) -> usize {
        self.tree.sacks_n
    }

    pub fn parent_n(&self) -> usize {
        self.tree.parents.len()
    }

    pub fn nack_requests(&self) -> usize {
        self.tree.nack_requests
    }

    /// Where the current acknowledgment round stands.
    pub fn round_state(&self) -> RoundState {
        if !self.tree.reliable_in_progress {
            RoundState::Idle
        } else if self.tree.is_complete() {
            RoundState::RoundComplete
        } else {
            RoundState::AckExchangeStarted
        }
    }

    /// Descriptors per owner, in the order free, posted, window, pending,
    /// detached.  At rest the detached count is zero and the sum equals the
    /// pool capacity.
    pub fn descriptor_census(&self) -> [usize; 5] {
        [
            self.pool.count(Membership::Free),
            self.pool.count(Membership::Posted),
            self.pool.count(Membership::Window),
            self.pool.count(Membership::Pending),
            self.pool.count(Membership::Detached),
        ]
    }
}
