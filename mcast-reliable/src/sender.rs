//! Send pipeline and send-completion polling.
//!
//! The root pushes payload chunks into the multicast send queue.  Admission
//! is bounded twice:
//!
//! - **Send queue depth.**  Only one send in every `scq_moderation` is
//!   signaled, so the number of sends the hardware may still hold is
//!   `pending_send * scq_moderation + tx`.  Once that reaches `sx_depth` the
//!   pipeline drains one completion and stops for this call.
//! - **Window.**  A call never sends past the slots left in the current
//!   acknowledgment round ([`Communicator::free_window`]).
//! - **Free descriptors.**  Every sent packet occupies a window slot through
//!   a pool descriptor; an empty pool stops the call early.
//!
//! Both stops are backpressure: the caller simply calls again.

use log::{error, trace};

use crate::comm::Communicator;
use crate::error::{McastError, Result};
use crate::packet::encode_imm;
use crate::pool::{Membership, Payload};
use crate::request::CollRequest;
use crate::transport::{ControlChannel, McastTransport, SendWorkRequest, WcStatus, MCAST_BCASTSEND_WR};

impl<T> Communicator<T>
where
    T: McastTransport + ControlChannel,
{
    /// Drain at most one send completion.
    pub fn poll_send(&mut self) -> Result<()> {
        let comps = self.transport.poll_send_cq(1).map_err(|e| {
            error!("comm {}: send queue poll completion failed: {e}", self.comm_id);
            McastError::from(e)
        })?;
        trace!("comm {}: polled send completions: {}", self.comm_id, comps.len());

        for wc in comps {
            if wc.status != WcStatus::Success {
                error!(
                    "comm {}: mcast send completion {:#x}: {}",
                    self.comm_id, wc.wr_id, wc.status
                );
                return Err(McastError::Completion {
                    status: wc.status,
                    wr_id: wc.wr_id,
                });
            }
            self.pending_send = self.pending_send.saturating_sub(1);
        }
        Ok(())
    }

    /// Post up to `num_packets` chunks of `req` starting at `req.offset`.
    ///
    /// Sends fewer when the window, the send queue or the pool runs dry.  With
    /// `zero_copy` the wire payload aliases the request buffer; otherwise it
    /// is copied into a staging buffer first.
    pub fn send(&mut self, req: &mut CollRequest<'_>, num_packets: u32, zero_copy: bool) -> Result<()> {
        let mpp = self.config.max_per_packet;
        let mut offset = req.offset;
        let num_packets = (num_packets as usize).min(self.free_window());

        for _ in 0..num_packets {
            if req.to_send == 0 {
                break;
            }
            if self.config.sx_depth <= self.pending_send * self.config.scq_moderation + self.tx {
                self.poll_send()?;
                break;
            }
            let Some(id) = self.pool.acquire() else {
                trace!("comm {}: no free descriptor, send deferred", self.comm_id);
                break;
            };

            let length = if req.to_send == 1 { req.last_pkt_len } else { mpp };
            let psn = self.psn;
            if zero_copy {
                self.pool.alias(id, offset);
                self.pool.get_mut(id).length = length;
            } else {
                self.pool.stage(id, &req.buf[offset..offset + length]);
            }
            self.pool.get_mut(id).psn = psn;

            let evicted = self.window.record(psn, id);
            debug_assert!(evicted.is_none(), "psn {psn} overwrote a live window slot");
            if let Some(old) = evicted {
                self.pool.unalias(old);
                self.pool.release(old);
            }
            self.pool.set_membership(id, Membership::Window);
            self.psn = self.psn.wrapping_add(1);
            req.to_send -= 1;
            offset += length;
            self.tx += 1;

            let mut signaled = false;
            if self.tx == self.config.scq_moderation {
                signaled = true;
                self.tx = 0;
                self.pending_send += 1;
            }

            let payload: &[u8] = match self.pool.get(id).payload {
                Payload::Staged => self.pool.staged(id),
                Payload::Aliased { offset } => &req.buf[offset..offset + length],
            };
            let wr = SendWorkRequest {
                wr_id: MCAST_BCASTSEND_WR,
                imm_data: encode_imm(psn),
                payload,
                lkey: req.mr.lkey,
                inline: length <= self.config.max_inline,
                signaled,
            };
            trace!(
                "comm {}: post_send psn {psn} length {length} zcopy {zero_copy} signaled {signaled}",
                self.comm_id
            );

            if let Err(e) = self.transport.post_send(&wr) {
                error!(
                    "comm {}: post send failed: {e}, start_psn {}, to_send {}, to_recv {}, length {length}, psn {psn}, inline {}",
                    self.comm_id,
                    req.start_psn,
                    req.to_send,
                    req.to_recv,
                    length <= self.config.max_inline
                );
                req.offset = offset;
                return Err(e.into());
            }
            self.stats.packets_sent += 1;

            self.check_nack_requests(req, psn)?;
        }

        req.offset = offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::comm::Communicator;
    use crate::config::CommConfig;
    use crate::packet::{decode_imm, GRH_LENGTH};
    use crate::request::TreeLinks;
    use crate::simulator::{SimEndpoint, SimFabric, SimulatorConfig};
    use crate::transport::{McastTransport, MemoryRegion};

    fn config() -> CommConfig {
        CommConfig {
            wsize: 16,
            sx_depth: 64,
            rx_depth: 4,
            scq_moderation: 4,
            post_recv_thresh: 1,
            max_per_packet: 8,
            max_inline: 4,
            buf_n: 32,
            ..CommConfig::default()
        }
    }

    fn pair(cfg: CommConfig) -> (Communicator<SimEndpoint>, SimEndpoint) {
        let fabric = SimFabric::new(2, SimulatorConfig::default());
        let root = fabric.endpoint(0).unwrap();
        let peer = fabric.endpoint(1).unwrap();
        (Communicator::new(0, 2, 1, cfg, root).unwrap(), peer)
    }

    #[test]
    fn partial_send_when_pool_runs_dry() {
        let (mut comm, _peer) = pair(config());
        // Leave exactly three free descriptors.
        while comm.pool.available() > 3 {
            let id = comm.pool.acquire().unwrap();
            comm.pool.set_membership(id, crate::pool::Membership::Pending);
            comm.pending_q.push_back(id);
        }

        let mut data: Vec<u8> = (0..80u8).collect();
        let mr = MemoryRegion::new(7, data.len());
        let mut req = comm
            .init_bcast(&mut data, 0, mr, TreeLinks::binomial(0, 0, 2))
            .unwrap();
        assert_eq!(req.num_packets, 10);

        comm.send(&mut req, 10, false).unwrap();
        assert_eq!(req.to_send, 7);
        assert_eq!(req.offset, 3 * 8);
        assert_eq!(comm.psn(), 3);
        assert_eq!(comm.pool.available(), 0);
    }

    #[test]
    fn packets_carry_psn_and_payload() {
        let (mut comm, mut peer) = pair(config());
        peer.post_recv((0..4).map(|i| (i, vec![0u8; GRH_LENGTH + 8])).collect())
            .unwrap();

        let mut data = b"0123456789ab".to_vec();
        let mr = MemoryRegion::new(7, data.len());
        let mut req = comm
            .init_bcast(&mut data, 0, mr, TreeLinks::binomial(0, 0, 2))
            .unwrap();
        comm.send(&mut req, 2, false).unwrap();
        assert_eq!(req.to_send, 0);
        assert_eq!(req.offset, 12);

        let wcs = peer.poll_recv_cq(8).unwrap();
        assert_eq!(wcs.len(), 2);
        assert_eq!(decode_imm(wcs[0].imm_data), 0);
        assert_eq!(&wcs[0].buf[GRH_LENGTH..wcs[0].byte_len], b"01234567");
        assert_eq!(decode_imm(wcs[1].imm_data), 1);
        // Last packet is short.
        assert_eq!(wcs[1].byte_len, GRH_LENGTH + 4);
        assert_eq!(&wcs[1].buf[GRH_LENGTH..wcs[1].byte_len], b"89ab");
    }

    #[test]
    fn moderation_signals_every_nth_send() {
        let (mut comm, _peer) = pair(config());
        let mut data = vec![1u8; 8 * 9];
        let mr = MemoryRegion::new(7, data.len());
        let mut req = comm
            .init_bcast(&mut data, 0, mr, TreeLinks::binomial(0, 0, 2))
            .unwrap();
        comm.send(&mut req, 9, false).unwrap();
        assert_eq!(comm.pending_send(), 2);
        assert_eq!(comm.tx, 1);

        comm.poll_send().unwrap();
        assert_eq!(comm.pending_send(), 1);
    }

    #[test]
    fn full_send_queue_drains_and_stops() {
        let cfg = CommConfig {
            sx_depth: 4,
            scq_moderation: 2,
            ..config()
        };
        let (mut comm, _peer) = pair(cfg);
        let mut data = vec![1u8; 8 * 8];
        let mr = MemoryRegion::new(7, data.len());
        let mut req = comm
            .init_bcast(&mut data, 0, mr, TreeLinks::binomial(0, 0, 2))
            .unwrap();

        comm.send(&mut req, 8, false).unwrap();
        // Four sends fill the queue; the fifth attempt polls one completion and stops.
        assert_eq!(req.to_send, 4);
        assert_eq!(comm.pending_send(), 1);

        comm.send(&mut req, 8, false).unwrap();
        assert_eq!(req.to_send, 2);
    }

    #[test]
    fn zero_copy_aliases_request_buffer() {
        let (mut comm, _peer) = pair(config());
        let mut data = vec![9u8; 20];
        let mr = MemoryRegion::new(7, data.len());
        let mut req = comm
            .init_bcast(&mut data, 0, mr, TreeLinks::binomial(0, 0, 2))
            .unwrap();
        comm.send(&mut req, 3, true).unwrap();
        let id = comm.window.get(1).unwrap();
        assert_eq!(
            comm.pool.get(id).payload,
            crate::pool::Payload::Aliased { offset: 8 }
        );
        assert_eq!(comm.pool.get(comm.window.get(2).unwrap()).length, 4);
    }

    #[test]
    fn send_stops_at_window_edge() {
        let cfg = CommConfig { wsize: 4, ..config() };
        let (mut comm, _peer) = pair(cfg);
        let mut data = vec![3u8; 8 * 8];
        let mr = MemoryRegion::new(7, data.len());
        let mut req = comm
            .init_bcast(&mut data, 0, mr, TreeLinks::binomial(0, 0, 2))
            .unwrap();

        comm.send(&mut req, 8, false).unwrap();
        assert_eq!(req.to_send, 4);
        assert_eq!(comm.free_window(), 0);
        assert_eq!(comm.window.len(), 4);
        assert_eq!(comm.descriptor_census(), [28, 0, 4, 0, 0]);

        // Releasing the round hands every descriptor back.
        while comm.last_acked != comm.psn {
            let id = comm.window.take(comm.last_acked).unwrap();
            comm.pool.release(id);
            comm.last_acked = comm.last_acked.wrapping_add(1);
        }
        assert_eq!(comm.descriptor_census(), [32, 0, 0, 0, 0]);

        comm.send(&mut req, 8, false).unwrap();
        assert_eq!(req.to_send, 0);
        assert_eq!(comm.descriptor_census(), [28, 0, 4, 0, 0]);
    }

    #[test]
    fn inline_only_up_to_max_inline() {
        let sim = SimulatorConfig {
            max_inline: 4,
            ..SimulatorConfig::default()
        };
        let fabric = SimFabric::new(2, sim);
        let mut comm = Communicator::new(0, 2, 1, config(), fabric.endpoint(0).unwrap()).unwrap();
        let _peer = fabric.endpoint(1).unwrap();

        // An 8-byte chunk followed by a 4-byte tail, with max_inline of 4.
        let mut data = b"0123456789ab".to_vec();
        let mr = MemoryRegion::new(7, data.len());
        let mut req = comm
            .init_bcast(&mut data, 0, mr, TreeLinks::binomial(0, 0, 2))
            .unwrap();

        comm.send(&mut req, 1, false).unwrap();
        assert_eq!(fabric.stats().inline_sends, 0);
        comm.send(&mut req, 1, false).unwrap();
        let stats = fabric.stats();
        assert_eq!((stats.frames_sent, stats.inline_sends), (2, 1));
    }

    #[test]
    fn failed_post_is_fatal() {
        let (mut comm, _peer) = pair(config());
        comm.transport_mut().fail_next_send();
        let mut data = vec![1u8; 16];
        let mr = MemoryRegion::new(7, data.len());
        let mut req = comm
            .init_bcast(&mut data, 0, mr, TreeLinks::binomial(0, 0, 2))
            .unwrap();
        assert!(comm.send(&mut req, 2, false).is_err());
    }
}
