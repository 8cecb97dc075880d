//! Receive-completion polling.
//!
//! Two pollers drain the multicast receive queue:
//!
//! - [`Communicator::recv`] runs while a broadcast still expects packets.
//!   It feeds every completion through the reassembly engine under a
//!   delivery budget.
//! - [`Communicator::poll_recv`] runs during an acknowledgment round, when
//!   nothing is being delivered.  It only parks packets that are still
//!   ahead of the receive point so the next collective can consume them.
//!
//! Both hand every completion's buffer back to its descriptor first and keep
//! the hardware queue topped up afterwards.

use log::{error, trace};

use crate::comm::Communicator;
use crate::error::{McastError, Result};
use crate::packet::{decode_imm, payload_len};
use crate::pool::{DescId, Membership};
use crate::request::CollRequest;
use crate::transport::{ControlChannel, McastTransport, RecvCompletion, WcStatus};
use crate::window::psn_le;

impl<T> Communicator<T>
where
    T: McastTransport + ControlChannel,
{
    /// Deliver packets of `req` under a budget of `num_left`; returns the
    /// unused budget.
    ///
    /// The pending queue is retried before the hardware is polled, and those
    /// retries are delivered even past the budget.  Fresh completions, and
    /// the rescan after every polled batch that delivered something, stop
    /// once the budget is spent.
    pub fn recv(&mut self, req: &mut CollRequest<'_>, num_left: usize) -> Result<usize> {
        let mut num_left = num_left;
        self.scan_pending(req, &mut num_left, false)?;

        while num_left > 0 {
            let comps = self.transport.poll_recv_cq(self.config.poll_batch).map_err(|e| {
                error!("comm {}: recv queue poll completion failed: {e}", self.comm_id);
                McastError::from(e)
            })?;
            if comps.is_empty() {
                break;
            }

            let polled = comps.len();
            let delivered_before = self.stats.packets_delivered;
            for wc in comps {
                self.pending_recv = self.pending_recv.saturating_sub(1);
                let id = self.take_completion(wc)?;
                self.process_packet(req, id, &mut num_left, false)?;
            }
            trace!("comm {}: polled {polled} recv completions", self.comm_id);
            self.post_recv_buffers()?;

            if num_left > 0 && self.stats.packets_delivered != delivered_before && !self.pending_q.is_empty() {
                self.scan_pending(req, &mut num_left, true)?;
            }
        }
        Ok(num_left)
    }

    /// Drain the receive queue without delivering anything.
    ///
    /// Packets at or beyond the receive point are parked on the pending
    /// queue; older ones are duplicates and go straight back to the pool.
    pub fn poll_recv(&mut self) -> Result<()> {
        loop {
            let comps = self.transport.poll_recv_cq(1).map_err(|e| {
                error!("comm {}: recv queue poll completion failed: {e}", self.comm_id);
                McastError::from(e)
            })?;
            let Some(wc) = comps.into_iter().next() else {
                return Ok(());
            };
            self.pending_recv = self.pending_recv.saturating_sub(1);

            let id = self.take_completion(wc)?;
            let psn = self.pool.get(id).psn;
            if psn_le(self.psn, psn) {
                trace!("comm {}: parked psn {psn} for later", self.comm_id);
                self.pool.set_membership(id, Membership::Pending);
                self.pending_q.push_back(id);
            } else {
                self.pool.release(id);
                self.stats.duplicates += 1;
            }
            self.post_recv_buffers()?;
        }
    }

    /// Give a completion's buffer back to its descriptor and decode the
    /// packet header fields into it.
    fn take_completion(&mut self, wc: RecvCompletion) -> Result<DescId> {
        let Some(id) = self.pool.posted_id(wc.wr_id) else {
            error!(
                "comm {}: recv completion {:#x} names no posted buffer",
                self.comm_id, wc.wr_id
            );
            return Err(McastError::UnknownWrId { wr_id: wc.wr_id });
        };
        self.pool.restore(id, wc.buf);

        if wc.status != WcStatus::Success {
            error!(
                "comm {}: mcast recv completion {:#x}: {}",
                self.comm_id, wc.wr_id, wc.status
            );
            self.pool.release(id);
            return Err(McastError::Completion {
                status: wc.status,
                wr_id: wc.wr_id,
            });
        }
        let Some(length) = payload_len(wc.byte_len) else {
            self.pool.release(id);
            return Err(McastError::Truncated {
                byte_len: wc.byte_len,
            });
        };

        let desc = self.pool.get_mut(id);
        desc.psn = decode_imm(wc.imm_data);
        desc.length = length;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use crate::comm::Communicator;
    use crate::config::CommConfig;
    use crate::error::McastError;
    use crate::packet::{encode_imm, GRH_LENGTH};
    use crate::request::TreeLinks;
    use crate::simulator::{SimEndpoint, SimFabric, SimulatorConfig};
    use crate::transport::{MemoryRegion, RecvCompletion, WcStatus};

    const MPP: usize = 4;

    fn receiver() -> Communicator<SimEndpoint> {
        let cfg = CommConfig {
            wsize: 8,
            rx_depth: 8,
            post_recv_thresh: 2,
            max_per_packet: MPP,
            max_inline: 4,
            buf_n: 32,
            ..CommConfig::default()
        };
        let fabric = SimFabric::new(2, SimulatorConfig::default());
        let mut comm = Communicator::new(1, 2, 1, cfg, fabric.endpoint(1).unwrap()).unwrap();
        comm.prepost().unwrap();
        comm
    }

    #[test]
    fn prepost_fills_receive_queue() {
        let comm = receiver();
        assert_eq!(comm.pending_recv(), 8);
        assert_eq!(comm.descriptor_census(), [24, 8, 0, 0, 0]);
    }

    #[test]
    fn recv_reorders_into_caller_buffer() {
        let mut comm = receiver();
        for psn in [1u32, 0, 2] {
            assert!(comm.transport_mut().inject_recv(psn, &[psn as u8 + 1; MPP]));
        }
        let mut buf = vec![0u8; 3 * MPP];
        let mr = MemoryRegion::new(1, buf.len());
        let mut req = comm.init_bcast(&mut buf, 0, mr, TreeLinks::binomial(1, 0, 2)).unwrap();

        let left = comm.recv(&mut req, 3).unwrap();
        assert_eq!(left, 0);
        assert_eq!(req.to_recv, 0);
        assert_eq!(comm.pending_len(), 0);
        assert_eq!(req.buf, &[1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
    }

    #[test]
    fn budget_limits_delivery() {
        let mut comm = receiver();
        for psn in 0..3u32 {
            comm.transport_mut().inject_recv(psn, &[7; MPP]);
        }
        let mut buf = vec![0u8; 3 * MPP];
        let mr = MemoryRegion::new(1, buf.len());
        let mut req = comm.init_bcast(&mut buf, 0, mr, TreeLinks::binomial(1, 0, 2)).unwrap();

        assert_eq!(comm.recv(&mut req, 1).unwrap(), 0);
        assert_eq!(req.to_recv, 2);
        // The rest of the polled batch waits on the pending queue.
        assert_eq!(comm.pending_len(), 2);
        assert_eq!(comm.recv(&mut req, 2).unwrap(), 0);
        assert_eq!(req.to_recv, 0);
    }

    #[test]
    fn empty_queue_returns_full_budget() {
        let mut comm = receiver();
        let mut buf = vec![0u8; MPP];
        let mr = MemoryRegion::new(1, buf.len());
        let mut req = comm.init_bcast(&mut buf, 0, mr, TreeLinks::binomial(1, 0, 2)).unwrap();
        assert_eq!(comm.recv(&mut req, 1).unwrap(), 1);
    }

    #[test]
    fn poll_recv_parks_future_and_drops_old() {
        let mut comm = receiver();
        comm.psn = 5;
        comm.last_acked = 5;
        comm.transport_mut().inject_recv(3, &[0; MPP]);
        comm.transport_mut().inject_recv(6, &[0; MPP]);
        comm.poll_recv().unwrap();
        assert_eq!(comm.pending_len(), 1);
        assert_eq!(comm.stats().duplicates, 1);
        let [free, posted, window, pending, detached] = comm.descriptor_census();
        assert_eq!(free + posted + window + pending + detached, 32);
        assert_eq!(detached, 0);
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut comm = receiver();
        comm.transport_mut().inject_recv(0, &[0; 2 * MPP]);
        let mut buf = vec![0u8; MPP];
        let mr = MemoryRegion::new(1, buf.len());
        let mut req = comm.init_bcast(&mut buf, 0, mr, TreeLinks::binomial(1, 0, 2)).unwrap();
        assert!(matches!(comm.recv(&mut req, 1), Err(McastError::Completion { .. })));
    }

    #[test]
    fn completion_for_unposted_buffer_is_rejected() {
        let mut comm = receiver();
        let census = comm.descriptor_census();
        let wc = RecvCompletion {
            wr_id: 1 << 40,
            status: WcStatus::Success,
            byte_len: GRH_LENGTH + MPP,
            imm_data: encode_imm(0),
            buf: vec![0; GRH_LENGTH + MPP],
        };
        assert!(matches!(
            comm.take_completion(wc),
            Err(McastError::UnknownWrId { wr_id }) if wr_id == 1 << 40
        ));
        assert_eq!(comm.descriptor_census(), census);
    }

    #[test]
    fn receive_queue_is_replenished() {
        let mut comm = receiver();
        for psn in 0..4u32 {
            comm.transport_mut().inject_recv(psn, &[0; MPP]);
        }
        let mut buf = vec![0u8; 4 * MPP];
        let mr = MemoryRegion::new(1, buf.len());
        let mut req = comm.init_bcast(&mut buf, 0, mr, TreeLinks::binomial(1, 0, 2)).unwrap();
        comm.recv(&mut req, 4).unwrap();
        // Deficit of four is above the threshold of two: fully reposted.
        assert_eq!(comm.pending_recv(), 8);
    }
}
