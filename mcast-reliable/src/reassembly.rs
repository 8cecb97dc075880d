//! Reassembly engine.
//!
//! Every arriving descriptor, whether fresh from the completion queue or
//! retried from the pending queue, goes through
//! [`Communicator::process_packet`]:
//!
//! | Condition                                          | Outcome              |
//! |----------------------------------------------------|----------------------|
//! | psn already in the window, or below `last_acked`   | back to the free pool|
//! | next in order, inside request and window, budget   | copied to the caller |
//! | anything else                                      | pending queue        |
//!
//! The pending queue is scanned in arrival (FIFO) order, once per evaluation
//! point.  A packet that was overtaken during one pass is picked up by a
//! later one, so delivery into the caller buffer is always in psn order.

use log::trace;

use crate::comm::Communicator;
use crate::error::{McastError, Result};
use crate::pool::{DescId, Membership};
use crate::request::CollRequest;
use crate::transport::{ControlChannel, McastTransport};
use crate::window::{psn_le, psn_lt};

/// Classification of one arrived packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Duplicate or stale: discard.
    Stale,
    /// Copy into the request buffer now.
    Deliver,
    /// Keep for a later pass.
    Defer,
}

/// What [`Communicator::process_packet`] did with a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Discarded,
    Delivered,
    Queued,
}

impl<T> Communicator<T>
where
    T: McastTransport + ControlChannel,
{
    /// `true` when `psn` is inside both the request and the current window.
    pub(crate) fn psn_in_range(&self, req: &CollRequest<'_>, psn: u32) -> bool {
        req.contains(psn)
            && psn_le(self.last_acked, psn)
            && (psn.wrapping_sub(self.last_acked) as usize) < self.config.wsize
    }

    /// `true` when `psn` was already received or sent.
    pub(crate) fn psn_received(&self, psn: u32) -> bool {
        self.window.seen(psn) || psn_lt(psn, self.last_acked)
    }

    /// Decide what to do with a packet carrying `psn`.
    pub fn classify(&self, req: &CollRequest<'_>, psn: u32, num_left: usize, in_pending: bool) -> Verdict {
        if self.psn_received(psn) {
            Verdict::Stale
        } else if self.psn_in_range(req, psn) && psn == self.psn && (num_left > 0 || in_pending) {
            Verdict::Deliver
        } else {
            Verdict::Defer
        }
    }

    /// Route one arrived descriptor.
    ///
    /// `in_pending` marks a descriptor being retried from the pending queue:
    /// it is delivered even with no budget left, and deferring it leaves it
    /// where it is.  The caller of a pending retry owns re-queueing.
    pub fn process_packet(
        &mut self,
        req: &mut CollRequest<'_>,
        id: DescId,
        num_left: &mut usize,
        in_pending: bool,
    ) -> Result<Disposition> {
        let psn = self.pool.get(id).psn;
        match self.classify(req, psn, *num_left, in_pending) {
            Verdict::Stale => {
                trace!("comm {}: discard duplicate psn {psn}", self.comm_id);
                self.pool.release(id);
                self.stats.duplicates += 1;
                Ok(Disposition::Discarded)
            }
            Verdict::Deliver => {
                self.deliver(req, id)?;
                *num_left = num_left.saturating_sub(1);
                Ok(Disposition::Delivered)
            }
            Verdict::Defer => {
                if !in_pending {
                    self.pool.set_membership(id, Membership::Pending);
                    self.pending_q.push_back(id);
                }
                Ok(Disposition::Queued)
            }
        }
    }

    /// Copy a staged payload into the request buffer and record it.
    fn deliver(&mut self, req: &mut CollRequest<'_>, id: DescId) -> Result<()> {
        let mpp = self.config.max_per_packet;
        let (psn, length) = {
            let desc = self.pool.get(id);
            (desc.psn, desc.length)
        };
        let expected = req.len_of(psn, mpp);
        if length != expected {
            self.pool.release(id);
            return Err(McastError::LengthMismatch {
                psn,
                expected,
                got: length,
            });
        }

        if length > 0 {
            let dest = req.offset_of(psn, mpp);
            req.buf[dest..dest + length].copy_from_slice(self.pool.staged(id));
        }

        let evicted = self.window.record(psn, id);
        debug_assert!(evicted.is_none(), "psn {psn} overwrote a live window slot");
        self.pool.set_membership(id, Membership::Window);
        req.to_recv -= 1;
        req.delivered += length;
        self.psn = self.psn.wrapping_add(1);
        self.stats.packets_delivered += 1;
        trace!(
            "comm {}: delivered psn {psn} length {length}, to_recv {}",
            self.comm_id,
            req.to_recv
        );

        self.check_nack_requests(req, psn)
    }

    /// Re-evaluate the whole pending queue once, in arrival order.
    ///
    /// With `budgeted` the pass stops delivering once `num_left` reaches
    /// zero; otherwise pending retries are delivered regardless of budget.
    pub(crate) fn scan_pending(
        &mut self,
        req: &mut CollRequest<'_>,
        num_left: &mut usize,
        budgeted: bool,
    ) -> Result<()> {
        let queued = std::mem::take(&mut self.pending_q);
        let mut rest = queued.into_iter();
        while let Some(id) = rest.next() {
            if budgeted && *num_left == 0 {
                self.pending_q.push_back(id);
                self.pending_q.extend(rest.by_ref());
                break;
            }
            match self.process_packet(req, id, num_left, true) {
                Ok(Disposition::Queued) => self.pending_q.push_back(id),
                Ok(_) => {}
                Err(e) => {
                    self.pending_q.extend(rest);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
