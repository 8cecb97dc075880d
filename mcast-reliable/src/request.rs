//! Collective requests and their acknowledgment-tree links.

use crate::transport::MemoryRegion;
use crate::window::psn_le;
use crate::Rank;

/// How the root feeds payload to the send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    /// Copy each chunk into a pool staging buffer.
    Staged,
    /// Send straight from the caller's buffer.
    ZeroCopy,
}

/// A rank's neighbours in the acknowledgment tree of one collective.
///
/// The tree is an input to the core.  [`TreeLinks::binomial`] builds the
/// binomial tree rooted at the broadcast root for callers that have no
/// topology of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeLinks {
    pub parent: Option<Rank>,
    pub children: Vec<Rank>,
}

impl TreeLinks {
    pub fn new(parent: Option<Rank>, children: Vec<Rank>) -> Self {
        Self { parent, children }
    }

    /// Binomial tree over `size` ranks rooted at `root`.
    ///
    /// An empty group has no links.
    pub fn binomial(rank: Rank, root: Rank, size: u32) -> Self {
        let mut links = TreeLinks::default();
        if size == 0 {
            return links;
        }
        let size = u64::from(size);
        let root = u64::from(root) % size;
        let vrank = (u64::from(rank) % size + size - root) % size;
        let to_rank = |v: u64| ((v + root) % size) as Rank;
        let mut mask = 1u64;
        while mask < size {
            if vrank & mask != 0 {
                links.parent = Some(to_rank(vrank ^ mask));
                break;
            }
            let child = vrank ^ mask;
            if child < size {
                links.children.push(to_rank(child));
            }
            mask <<= 1;
        }
        links
    }
}

/// One in-flight broadcast, borrowed by the communicator while it runs.
#[derive(Debug)]
pub struct CollRequest<'a> {
    /// Caller buffer: the source on the root, the destination elsewhere.
    pub buf: &'a mut [u8],
    /// Bytes consumed (root) so far.
    pub offset: usize,
    pub start_psn: u32,
    pub num_packets: u32,
    pub to_send: u32,
    pub to_recv: u32,
    /// Length of the final, possibly short, packet.
    pub last_pkt_len: usize,
    pub mr: MemoryRegion,
    pub root: Rank,
    pub am_root: bool,
    pub proto: Proto,
    pub links: TreeLinks,
    /// Payload bytes written into `buf` by the reassembly engine.
    pub delivered: usize,
}

impl<'a> CollRequest<'a> {
    /// `true` when `psn` belongs to this request.
    pub fn contains(&self, psn: u32) -> bool {
        psn_le(self.start_psn, psn) && psn.wrapping_sub(self.start_psn) < self.num_packets
    }

    /// Byte offset of `psn`'s payload in the caller buffer.
    pub fn offset_of(&self, psn: u32, max_per_packet: usize) -> usize {
        psn.wrapping_sub(self.start_psn) as usize * max_per_packet
    }

    /// Expected payload length of `psn`.
    pub fn len_of(&self, psn: u32, max_per_packet: usize) -> usize {
        if psn.wrapping_sub(self.start_psn) + 1 == self.num_packets {
            self.last_pkt_len
        } else {
            max_per_packet
        }
    }

    /// Nothing left to send or receive.
    pub fn is_done(&self) -> bool {
        self.to_send == 0 && self.to_recv == 0
    }

    pub fn zero_copy(&self) -> bool {
        self.proto == Proto::ZeroCopy
    }
}
