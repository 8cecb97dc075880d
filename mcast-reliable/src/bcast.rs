//! Broadcast driver.
//!
//! [`Communicator::bcast_progress`] is the single entry point a caller
//! repeats until it returns [`Progress::Complete`].  Each step:
//!
//! 1. serves control traffic (ACKs, NACKs, retransmissions);
//! 2. on the root, sends as much of the request as the window allows;
//! 3. on receivers, delivers as much as the window allows, and counts a
//!    stall when nothing arrives;
//! 4. once the window is full or the request has nothing left to move,
//!    runs the acknowledgment round and recycles the window.
//!
//! Every request ends with a completed round, so a round never spans two
//! requests and the caller may reuse or drop its buffer as soon as the
//! request completes.

use log::debug;

use crate::comm::Communicator;
use crate::error::Result;
use crate::request::CollRequest;
use crate::state::Progress;
use crate::transport::{ControlChannel, McastTransport};

impl<T> Communicator<T>
where
    T: McastTransport + ControlChannel,
{
    /// One non-blocking step of a broadcast.
    pub fn bcast_progress(&mut self, req: &mut CollRequest<'_>) -> Result<Progress> {
        self.poll_control(req)?;
        self.check_nack_requests_all(req)?;

        let mut free = self.free_window();
        if req.am_root && req.to_send > 0 && free > 0 {
            let num = free.min(req.to_send as usize) as u32;
            self.send(req, num, req.zero_copy())?;
            free = self.free_window();
        }

        self.prepare_reliable(req);

        if free > 0 && req.to_recv > 0 {
            let budget = free.min(req.to_recv as usize);
            let left = self.recv(req, budget)?;
            if left < budget {
                self.drop.progress();
            } else {
                self.check_drop(req)?;
            }
            free = self.free_window();
        }

        if free == 0 || req.is_done() {
            return self.window_recycle(req);
        }
        Ok(Progress::InProgress)
    }

    /// Finish the current round, then release every window slot it covered.
    ///
    /// Returns [`Progress::Complete`] only when the request itself is done.
    pub fn window_recycle(&mut self, req: &mut CollRequest<'_>) -> Result<Progress> {
        if !self.reliable(req)?.is_complete() {
            return Ok(Progress::InProgress);
        }

        let mut released = 0usize;
        while self.last_acked != self.psn {
            if let Some(id) = self.window.take(self.last_acked) {
                self.pool.unalias(id);
                self.pool.release(id);
                released += 1;
            }
            self.last_acked = self.last_acked.wrapping_add(1);
        }
        self.stats.rounds += 1;

        let tag = self.round_tag();
        self.tree.recount_nacks(self.last_acked, self.config.wsize);
        self.tree.promote_early_acks(tag);
        debug!(
            "comm {}: window recycled, {released} slots released, last_acked {}",
            self.comm_id, self.last_acked
        );

        if req.is_done() {
            debug!(
                "comm {}: rank {} bcast psn [{}, +{}) complete",
                self.comm_id, self.rank, req.start_psn, req.num_packets
            );
            return Ok(Progress::Complete);
        }
        self.prepare_reliable(req);
        Ok(Progress::InProgress)
    }
}
