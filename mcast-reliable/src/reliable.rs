//! Acknowledgment rounds, NACK servicing and drop detection.
//!
//! Reliability is enforced per window.  When a rank's window fills, or its
//! request has nothing left to move, it runs an acknowledgment round over
//! the request's tree:
//!
//! ```text
//!          root                  ▲ ACK(tag) once everything in the
//!         /    \                 │ window has been received
//!      mid      leaf             │
//!       |                        │ NACK(psn) ──▶ parent
//!      leaf                      │ DATA(psn) ◀── parent
//! ```
//!
//! A round completes on a rank once every child has acknowledged it, an ACK
//! has gone to every parent and no NACK that belongs to the window is still
//! queued.  Only then may the window slots be recycled: a child may still
//! ask for any packet in them until its ACK arrives.
//!
//! ACKs carry a round tag, the first psn past the window they acknowledge.
//! A child can finish a round and ACK the next one before its parent is done
//! with the current one; such early ACKs are kept until the parent's window
//! catches up.

use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, error, trace, warn};

use crate::comm::Communicator;
use crate::error::Result;
use crate::packet::{ControlKind, ControlPacket};
use crate::pool::{DescId, Membership, Payload};
use crate::request::CollRequest;
use crate::state::Progress;
use crate::transport::{ControlChannel, McastTransport};
use crate::window::psn_lt;
use crate::Rank;

/// A retransmission a child asked for that could not be served yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NackRequest {
    pub psn: u32,
    pub from: Rank,
}

/// Per-communicator acknowledgment-tree bookkeeping.
#[derive(Debug, Default)]
pub(crate) struct AckTree {
    /// Union of parents over the requests prepared this round.
    pub parents: Vec<Rank>,
    /// Union of children over the requests prepared this round.
    pub children: Vec<Rank>,
    /// Children whose ACK for the current round arrived.
    pub acked_children: Vec<Rank>,
    pub racks_n: usize,
    pub sacks_n: usize,
    /// Queued NACKs for psns inside the current window.
    pub nack_requests: usize,
    pub reliable_in_progress: bool,
    pub pending_nacks: VecDeque<NackRequest>,
    /// ACKs tagged for a later round, as `(child, tag)`.
    pub early_acks: Vec<(Rank, u32)>,
}

impl AckTree {
    /// All children acknowledged, all parents acknowledged, nothing owed.
    pub fn is_complete(&self) -> bool {
        self.racks_n == self.children.len() && self.sacks_n == self.parents.len() && self.nack_requests == 0
    }

    fn record_ack(&mut self, child: Rank) {
        if !self.acked_children.contains(&child) {
            self.acked_children.push(child);
            self.racks_n += 1;
        }
    }

    fn reset(&mut self) {
        self.parents.clear();
        self.children.clear();
        self.acked_children.clear();
        self.racks_n = 0;
        self.sacks_n = 0;
        self.reliable_in_progress = false;
    }

    /// Move early ACKs tagged `round_tag` into the current round.
    pub(crate) fn promote_early_acks(&mut self, round_tag: u32) {
        let early = std::mem::take(&mut self.early_acks);
        for (child, tag) in early {
            if tag == round_tag {
                self.record_ack(child);
            } else if psn_lt(round_tag, tag) {
                self.early_acks.push((child, tag));
            }
        }
    }

    /// Recount the queued NACKs that fall in `[low, low + wsize)`.
    pub(crate) fn recount_nacks(&mut self, low: u32, wsize: usize) {
        self.nack_requests = self
            .pending_nacks
            .iter()
            .filter(|n| in_window(n.psn, low, wsize))
            .count();
    }
}

fn in_window(psn: u32, low: u32, wsize: usize) -> bool {
    (psn.wrapping_sub(low) as usize) < wsize
}

fn add_unique(set: &mut Vec<Rank>, rank: Rank) {
    if !set.contains(&rank) {
        set.push(rank);
    }
}

/// Stall tracking for the receive side.
#[derive(Debug, Default)]
pub(crate) struct DropDetector {
    /// Consecutive receive polls without progress.
    pub stalled: u32,
    /// Started once `stalled` crosses the threshold.
    pub timer: Option<Instant>,
    /// psn of the NACK sent and not yet answered.
    pub outstanding: Option<u32>,
}

impl DropDetector {
    pub(crate) fn progress(&mut self) {
        self.stalled = 0;
        self.timer = None;
    }
}

impl<T> Communicator<T>
where
    T: McastTransport + ControlChannel,
{
    /// Tag of the current round: the first psn past the current window.
    pub(crate) fn round_tag(&self) -> u32 {
        self.last_acked.wrapping_add(self.config.wsize as u32)
    }

    /// Add the request's tree links to the current round.  Idempotent.
    pub fn prepare_reliable(&mut self, req: &CollRequest<'_>) {
        if let Some(parent) = req.links.parent {
            add_unique(&mut self.tree.parents, parent);
        }
        for &child in &req.links.children {
            add_unique(&mut self.tree.children, child);
        }
    }

    /// One non-blocking step of the acknowledgment round.
    ///
    /// On completion the round counters are reset so the next round starts
    /// from `Idle`.
    pub fn reliable(&mut self, req: &mut CollRequest<'_>) -> Result<Progress> {
        if !self.tree.is_complete() {
            if self.pending_send > 0 {
                self.poll_send()?;
            }
            if !self.tree.parents.is_empty() {
                self.poll_recv()?;
            }
            self.poll_control(req)?;
            self.check_nack_requests_all(req)?;
        }

        if !self.tree.parents.is_empty() && !self.tree.reliable_in_progress {
            self.reliable_send()?;
        }
        self.tree.reliable_in_progress = true;

        if self.tree.is_complete() {
            debug!(
                "comm {}: round {} complete, children {}, parents {}",
                self.comm_id,
                self.round_tag(),
                self.tree.children.len(),
                self.tree.parents.len()
            );
            self.tree.reset();
            return Ok(Progress::Complete);
        }
        Ok(Progress::InProgress)
    }

    /// Acknowledge the current round to every parent.
    fn reliable_send(&mut self) -> Result<()> {
        let tag = self.round_tag();
        let bytes = ControlPacket::ack(self.comm_id, self.rank, tag).encode();
        for i in 0..self.tree.parents.len() {
            let parent = self.tree.parents[i];
            self.transport.send_to(parent, bytes.clone()).map_err(|e| {
                error!("comm {}: ack to {parent} failed: {e}", self.comm_id);
                e
            })?;
            self.tree.sacks_n += 1;
            trace!("comm {}: ack {tag} sent to {parent}", self.comm_id);
        }
        Ok(())
    }

    /// Drain the control channel.
    pub(crate) fn poll_control(&mut self, req: &mut CollRequest<'_>) -> Result<()> {
        while let Some((from, bytes)) = self.transport.try_recv()? {
            let pkt = ControlPacket::decode(&bytes)?;
            if pkt.comm_id != self.comm_id {
                warn!(
                    "comm {}: control packet for comm {} from {from} dropped",
                    self.comm_id, pkt.comm_id
                );
                continue;
            }
            match pkt.kind {
                ControlKind::Ack => self.on_ack(from, pkt.psn),
                ControlKind::Nack => self.on_nack(req, from, pkt.psn)?,
                ControlKind::Data => self.on_data(req, pkt.psn, &pkt.payload)?,
            }
        }
        Ok(())
    }

    fn on_ack(&mut self, from: Rank, tag: u32) {
        let current = self.round_tag();
        if tag == current {
            self.tree.record_ack(from);
            trace!(
                "comm {}: ack {tag} from {from}, racks {}/{}",
                self.comm_id,
                self.tree.racks_n,
                self.tree.children.len()
            );
        } else if psn_lt(current, tag) {
            self.tree.early_acks.push((from, tag));
        } else {
            debug!("comm {}: stale ack {tag} from {from}", self.comm_id);
        }
    }

    fn on_nack(&mut self, req: &CollRequest<'_>, from: Rank, psn: u32) -> Result<()> {
        if psn_lt(psn, self.last_acked) {
            warn!(
                "comm {}: nack for psn {psn} from {from} below last_acked {}",
                self.comm_id, self.last_acked
            );
            return Ok(());
        }
        if let Some(id) = self.window.get(psn) {
            return self.resend_packet(req, from, id);
        }
        trace!("comm {}: queued nack for psn {psn} from {from}", self.comm_id);
        self.tree.pending_nacks.push_back(NackRequest { psn, from });
        if in_window(psn, self.last_acked, self.config.wsize) {
            self.tree.nack_requests += 1;
        }
        Ok(())
    }

    fn on_data(&mut self, req: &mut CollRequest<'_>, psn: u32, payload: &[u8]) -> Result<()> {
        if self.drop.outstanding == Some(psn) {
            self.drop.outstanding = None;
        }
        if self.psn_received(psn) {
            self.stats.duplicates += 1;
            return Ok(());
        }
        if payload.len() > self.config.max_per_packet {
            warn!(
                "comm {}: retransmitted psn {psn} carries {} bytes, dropped",
                self.comm_id,
                payload.len()
            );
            return Ok(());
        }
        let Some(id) = self.pool.acquire().or_else(|| self.reclaim_pending()) else {
            warn!("comm {}: no descriptor for retransmitted psn {psn}", self.comm_id);
            return Ok(());
        };
        self.pool.stage(id, payload);
        self.pool.get_mut(id).psn = psn;

        let mut budget = self.free_window().min(req.to_recv as usize);
        self.process_packet(req, id, &mut budget, false)?;
        Ok(())
    }

    /// Take back the most recent pending descriptor from a later window.
    ///
    /// Frees room for a retransmission of the window currently being
    /// completed; the evicted packet is recovered by a later NACK.
    fn reclaim_pending(&mut self) -> Option<DescId> {
        let pos = self.pending_q.iter().rposition(|&id| {
            !in_window(self.pool.get(id).psn, self.last_acked, self.config.wsize)
        })?;
        let id = self.pending_q.remove(pos)?;
        self.pool.set_membership(id, Membership::Detached);
        Some(id)
    }

    /// Send the packet held by `id` to `to` over the control channel.
    fn resend_packet(&mut self, req: &CollRequest<'_>, to: Rank, id: DescId) -> Result<()> {
        let desc = self.pool.get(id);
        let psn = desc.psn;
        let payload: &[u8] = match desc.payload {
            Payload::Staged => self.pool.staged(id),
            Payload::Aliased { offset } => {
                if !req.contains(psn) {
                    error!(
                        "comm {}: psn {psn} aliases a finished request, nack from {to} not served",
                        self.comm_id
                    );
                    return Ok(());
                }
                &req.buf[offset..offset + desc.length]
            }
        };
        let bytes = ControlPacket::data(self.comm_id, self.rank, psn, payload).encode();
        self.transport.send_to(to, bytes)?;
        self.stats.retransmits += 1;
        debug!("comm {}: retransmitted psn {psn} to {to}", self.comm_id);
        Ok(())
    }

    /// Serve every queued NACK for `psn`, which just became available.
    pub(crate) fn check_nack_requests(&mut self, req: &CollRequest<'_>, psn: u32) -> Result<()> {
        if self.tree.pending_nacks.is_empty() {
            return Ok(());
        }
        let Some(id) = self.window.get(psn) else {
            return Ok(());
        };
        let queued = std::mem::take(&mut self.tree.pending_nacks);
        for nack in queued {
            if nack.psn == psn {
                self.resend_packet(req, nack.from, id)?;
                self.tree.nack_requests = self.tree.nack_requests.saturating_sub(1);
            } else {
                self.tree.pending_nacks.push_back(nack);
            }
        }
        Ok(())
    }

    /// Serve every queued NACK whose psn is now held in the window.
    pub(crate) fn check_nack_requests_all(&mut self, req: &CollRequest<'_>) -> Result<()> {
        if self.tree.pending_nacks.is_empty() {
            return Ok(());
        }
        let queued = std::mem::take(&mut self.tree.pending_nacks);
        for nack in queued {
            match self.window.get(nack.psn) {
                Some(id) => {
                    self.resend_packet(req, nack.from, id)?;
                    self.tree.nack_requests = self.tree.nack_requests.saturating_sub(1);
                }
                None => self.tree.pending_nacks.push_back(nack),
            }
        }
        Ok(())
    }

    /// Count a receive poll that made no progress; NACK the parent once the
    /// stall has lasted `drop_threshold` polls and then `nack_timeout`.
    pub(crate) fn check_drop(&mut self, req: &CollRequest<'_>) -> Result<()> {
        let Some(parent) = req.links.parent else {
            return Ok(());
        };
        if self.drop.outstanding.is_some() {
            return Ok(());
        }
        if self.drop.stalled < self.config.drop_threshold {
            self.drop.stalled += 1;
            return Ok(());
        }
        match self.drop.timer {
            None => {
                self.drop.timer = Some(Instant::now());
                Ok(())
            }
            Some(started) if started.elapsed() < self.config.nack_timeout => Ok(()),
            Some(_) => {
                self.drop.progress();
                self.send_nack(parent)
            }
        }
    }

    fn send_nack(&mut self, parent: Rank) -> Result<()> {
        let psn = self.psn;
        let bytes = ControlPacket::nack(self.comm_id, self.rank, psn).encode();
        self.transport.send_to(parent, bytes)?;
        self.drop.outstanding = Some(psn);
        self.stats.nacks_sent += 1;
        debug!("comm {}: psn {psn} presumed lost, nack sent to {parent}", self.comm_id);
        Ok(())
    }
}
