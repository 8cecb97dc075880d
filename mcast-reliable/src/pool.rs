//! Packet descriptor arena and free pool.
//!
//! Every descriptor lives in one arena for the lifetime of its communicator
//! and is addressed by [`DescId`].  Instead of threading descriptors through
//! intrusive lists, each one carries a [`Membership`] tag and the pool is the
//! only place that changes it, so a descriptor can never sit in two queues at
//! once.
//!
//! ```text
//!            acquire()                 record in window
//!   Free ───────────────▶ Detached ─────────────────────▶ Window
//!    ▲                     │   ▲                            │
//!    │ release()           │   │ poll completion            │ recycle
//!    │                     ▼   │                            │
//!    ├───────────────── Pending  Posted ◀── post_recv ──────┘
//!    └───────────────────────────────────────────────────────
//! ```
//!
//! A descriptor whose buffer is posted to the hardware receive queue has
//! lent that buffer out; it comes back with the receive completion.

use std::collections::VecDeque;

use crate::packet::GRH_LENGTH;

/// Index of a descriptor in the pool arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescId(usize);

impl DescId {
    /// Work-request id carried through the hardware queues.
    pub fn wr_id(self) -> u64 {
        self.0 as u64
    }
}

/// Where a descriptor's payload bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// In the descriptor's own staging buffer, after the routing header.
    Staged,
    /// Zero-copy: in the caller's request buffer at `offset`.
    Aliased { offset: usize },
}

/// Which owner currently holds a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Free,
    /// Buffer lent to the hardware receive queue.
    Posted,
    /// Sent or delivered, tracked by the receive window.
    Window,
    /// Arrived but not yet deliverable.
    Pending,
    /// In hand inside a single call.
    Detached,
}

/// One fixed-size packet buffer plus its protocol metadata.
#[derive(Debug)]
pub struct PacketDescriptor {
    buf: Vec<u8>,
    pub psn: u32,
    pub length: usize,
    pub payload: Payload,
    membership: Membership,
}

impl PacketDescriptor {
    pub fn membership(&self) -> Membership {
        self.membership
    }
}

/// Fixed set of staging descriptors recycled through the free list.
#[derive(Debug)]
pub struct BufferPool {
    descs: Vec<PacketDescriptor>,
    free: VecDeque<DescId>,
    max_per_packet: usize,
}

impl BufferPool {
    /// Allocate `count` descriptors, each able to hold a routing header plus
    /// `max_per_packet` payload bytes.
    pub fn new(count: usize, max_per_packet: usize) -> Self {
        let descs = (0..count)
            .map(|_| PacketDescriptor {
                buf: vec![0u8; GRH_LENGTH + max_per_packet],
                psn: 0,
                length: 0,
                payload: Payload::Staged,
                membership: Membership::Free,
            })
            .collect();
        Self {
            descs,
            free: (0..count).map(DescId).collect(),
            max_per_packet,
        }
    }

    /// Total number of descriptors.
    pub fn capacity(&self) -> usize {
        self.descs.len()
    }

    /// Descriptors currently on the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Take a free descriptor, or `None` when the pool is empty.
    ///
    /// An empty pool is backpressure, not an error: the caller stops and
    /// retries on a later progress call.
    pub fn acquire(&mut self) -> Option<DescId> {
        let id = self.free.pop_front()?;
        let desc = &mut self.descs[id.0];
        debug_assert_eq!(desc.membership, Membership::Free);
        debug_assert_eq!(desc.payload, Payload::Staged);
        desc.membership = Membership::Detached;
        Some(id)
    }

    /// Return a staging descriptor to the free list.
    ///
    /// Zero-copy descriptors must be detached with [`BufferPool::unalias`]
    /// first; the caller's buffer is never owned by the pool.
    pub fn release(&mut self, id: DescId) {
        let desc = &mut self.descs[id.0];
        debug_assert_eq!(desc.payload, Payload::Staged, "aliased descriptor released");
        debug_assert_ne!(desc.membership, Membership::Free, "double release");
        debug_assert_ne!(desc.membership, Membership::Posted, "release of posted buffer");
        desc.membership = Membership::Free;
        self.free.push_back(id);
    }

    /// Point a descriptor at the caller's buffer instead of its staging area.
    pub fn alias(&mut self, id: DescId, offset: usize) {
        self.descs[id.0].payload = Payload::Aliased { offset };
    }

    /// Drop a descriptor's zero-copy alias so it can be released.
    pub fn unalias(&mut self, id: DescId) {
        self.descs[id.0].payload = Payload::Staged;
    }

    /// Move a descriptor to a new owner.
    pub fn set_membership(&mut self, id: DescId, membership: Membership) {
        debug_assert_ne!(membership, Membership::Free, "use release()");
        self.descs[id.0].membership = membership;
    }

    pub fn get(&self, id: DescId) -> &PacketDescriptor {
        &self.descs[id.0]
    }

    pub fn get_mut(&mut self, id: DescId) -> &mut PacketDescriptor {
        &mut self.descs[id.0]
    }

    /// Payload bytes of a staged descriptor.
    pub fn staged(&self, id: DescId) -> &[u8] {
        let desc = &self.descs[id.0];
        &desc.buf[GRH_LENGTH..GRH_LENGTH + desc.length]
    }

    /// Copy `data` into a descriptor's staging area and set its length.
    pub fn stage(&mut self, id: DescId, data: &[u8]) {
        debug_assert!(data.len() <= self.max_per_packet);
        let desc = &mut self.descs[id.0];
        desc.buf[GRH_LENGTH..GRH_LENGTH + data.len()].copy_from_slice(data);
        desc.length = data.len();
    }

    /// Lend a descriptor's buffer to the hardware receive queue.
    pub fn lend(&mut self, id: DescId) -> Vec<u8> {
        let desc = &mut self.descs[id.0];
        desc.membership = Membership::Posted;
        std::mem::take(&mut desc.buf)
    }

    /// Descriptor a receive completion's `wr_id` refers to, if it names one
    /// whose buffer is currently posted.
    pub fn posted_id(&self, wr_id: u64) -> Option<DescId> {
        let idx = usize::try_from(wr_id).ok()?;
        match self.descs.get(idx) {
            Some(desc) if desc.membership == Membership::Posted => Some(DescId(idx)),
            _ => None,
        }
    }

    /// Take back a buffer returned by a receive completion.
    pub fn restore(&mut self, id: DescId, buf: Vec<u8>) {
        let desc = &mut self.descs[id.0];
        debug_assert_eq!(desc.membership, Membership::Posted);
        desc.buf = buf;
        desc.membership = Membership::Detached;
    }

    /// Number of descriptors with the given membership.
    pub fn count(&self, membership: Membership) -> usize {
        self.descs.iter().filter(|d| d.membership == membership).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_until_empty() {
        let mut pool = BufferPool::new(2, 64);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert!(pool.acquire().is_none());
        assert_eq!(pool.count(Membership::Detached), 2);
    }

    #[test]
    fn release_is_fifo() {
        let mut pool = BufferPool::new(3, 64);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(b);
        pool.release(a);
        // Remaining free descriptor comes out first, then the released ones in order.
        let c = pool.acquire().unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
        assert_eq!(pool.acquire(), Some(b));
        assert_eq!(pool.acquire(), Some(a));
    }

    #[test]
    fn stage_and_read_back() {
        let mut pool = BufferPool::new(1, 16);
        let id = pool.acquire().unwrap();
        pool.stage(id, b"abc");
        assert_eq!(pool.staged(id), b"abc");
        assert_eq!(pool.get(id).length, 3);
    }

    #[test]
    fn alias_must_be_cleared_before_release() {
        let mut pool = BufferPool::new(1, 16);
        let id = pool.acquire().unwrap();
        pool.alias(id, 128);
        assert_eq!(pool.get(id).payload, Payload::Aliased { offset: 128 });
        pool.unalias(id);
        pool.release(id);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn lend_and_restore_buffer() {
        let mut pool = BufferPool::new(1, 16);
        let id = pool.acquire().unwrap();
        let buf = pool.lend(id);
        assert_eq!(buf.len(), GRH_LENGTH + 16);
        assert_eq!(pool.get(id).membership(), Membership::Posted);
        pool.restore(id, buf);
        assert_eq!(pool.get(id).membership(), Membership::Detached);
    }

    #[test]
    fn posted_id_rejects_unknown_and_idle() {
        let mut pool = BufferPool::new(2, 16);
        let id = pool.acquire().unwrap();
        assert_eq!(pool.posted_id(id.wr_id()), None);
        let _buf = pool.lend(id);
        assert_eq!(pool.posted_id(id.wr_id()), Some(id));
        assert_eq!(pool.posted_id(2), None);
        assert_eq!(pool.posted_id(u64::MAX), None);
    }
}
