//! In-process multicast fabric for deterministic testing.
//!
//! Real unreliable-datagram multicast drops, reorders, and duplicates
//! packets, and silently discards anything that finds no posted receive
//! buffer.  To exercise the reliability layer without hardware, this module
//! provides a [`SimFabric`] shared by every rank of a group and one
//! [`SimEndpoint`] per rank implementing both collaborator traits.
//!
//! | Fault            | Description                                         |
//! |------------------|-----------------------------------------------------|
//! | Packet loss      | Drop a frame for one receiver with `loss_rate`.     |
//! | Reordering       | Hold a frame back until the next one to the same    |
//! |                  | receiver has been delivered.                        |
//! | Duplication      | Deliver a frame twice.                              |
//! | No buffer        | A frame with no posted buffer at the receiver is    |
//! |                  | lost, as on the wire.                               |
//!
//! Every fault decision comes from one seeded RNG, so a failing run is
//! reproducible from its seed.  The point-to-point control channel is
//! reliable and ordered per peer pair.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::ConfigError;
use crate::packet::GRH_LENGTH;
use crate::transport::{
    ControlChannel, GroupSetup, McastTransport, RecvCompletion, SendCompletion, SendWorkRequest,
    TransportError, WcStatus,
};
use crate::Rank;

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that a frame is dropped on its way to one receiver.
    pub loss_rate: f64,
    /// Probability that a frame is held back and overtaken.
    pub reorder_rate: f64,
    /// Probability that a frame is delivered twice.
    pub duplicate_rate: f64,
    /// RNG seed for every fault decision.
    pub seed: u64,
    /// Largest payload accepted for an inline send.
    pub max_inline: usize,
    /// Address reported by transport probing.
    pub address: IpAddr,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the fabric is a lossless pass-through.
        Self {
            loss_rate: 0.0,
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            seed: 0,
            max_inline: 256,
            address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        }
    }
}

impl SimulatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("loss_rate", self.loss_rate),
            ("reorder_rate", self.reorder_rate),
            ("duplicate_rate", self.duplicate_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::BadProbability { name, value });
            }
        }
        Ok(())
    }
}

/// Clamp a probability into the range `random_bool` accepts.
fn probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

/// Fault counters of a fabric.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub frames_sent: u64,
    /// Sends posted with the inline flag.
    pub inline_sends: u64,
    pub frames_delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub reordered: u64,
    /// Frames that found no posted buffer.
    pub no_buffer: u64,
}

#[derive(Debug, Clone)]
struct Frame {
    imm_data: u32,
    /// Routing header followed by the payload.
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct Port {
    attached: bool,
    joined: bool,
    posted: VecDeque<(u64, Vec<u8>)>,
    recv_cq: VecDeque<RecvCompletion>,
    send_cq: VecDeque<SendCompletion>,
    held: Option<Frame>,
    inbox: VecDeque<(Rank, Vec<u8>)>,
    fail_next_send: bool,
    drop_incoming: usize,
}

impl Port {
    /// Land a frame in the next posted buffer.  Returns `false` when no
    /// buffer was posted.
    fn land(&mut self, frame: &Frame) -> bool {
        let Some((wr_id, mut buf)) = self.posted.pop_front() else {
            return false;
        };
        let (status, byte_len) = if frame.bytes.len() > buf.len() {
            (WcStatus::LocalLengthError, 0)
        } else {
            buf[..frame.bytes.len()].copy_from_slice(&frame.bytes);
            (WcStatus::Success, frame.bytes.len())
        };
        self.recv_cq.push_back(RecvCompletion {
            wr_id,
            status,
            byte_len,
            imm_data: frame.imm_data,
            buf,
        });
        true
    }
}

#[derive(Debug)]
struct FabricInner {
    ports: Vec<Port>,
    rng: StdRng,
    loss_rate: f64,
    reorder_rate: f64,
    duplicate_rate: f64,
    config: SimulatorConfig,
    stats: SimStats,
}

impl FabricInner {
    fn port(&mut self, rank: Rank) -> Result<&mut Port, TransportError> {
        self.ports.get_mut(rank as usize).ok_or(TransportError::BadRank(rank))
    }

    /// Fan a frame out to every joined port except the sender's.
    fn multicast(&mut self, src: Rank, frame: Frame) {
        self.stats.frames_sent += 1;
        let FabricInner {
            ports,
            rng,
            loss_rate,
            reorder_rate,
            duplicate_rate,
            stats,
            ..
        } = self;

        for (dst, port) in ports.iter_mut().enumerate() {
            if dst as Rank == src || !port.joined {
                continue;
            }
            if port.drop_incoming > 0 {
                port.drop_incoming -= 1;
                stats.dropped += 1;
                continue;
            }
            if rng.random_bool(*loss_rate) {
                stats.dropped += 1;
                continue;
            }
            let copies = if rng.random_bool(*duplicate_rate) {
                stats.duplicated += 1;
                2
            } else {
                1
            };
            for _ in 0..copies {
                if port.held.is_none() && rng.random_bool(*reorder_rate) {
                    stats.reordered += 1;
                    port.held = Some(frame.clone());
                    continue;
                }
                deliver(port, &frame, stats);
                if let Some(held) = port.held.take() {
                    deliver(port, &held, stats);
                }
            }
        }
    }
}

fn deliver(port: &mut Port, frame: &Frame, stats: &mut SimStats) {
    if port.land(frame) {
        stats.frames_delivered += 1;
    } else {
        stats.no_buffer += 1;
    }
}

/// The shared medium of one simulated group.
#[derive(Debug, Clone)]
pub struct SimFabric {
    inner: Arc<Mutex<FabricInner>>,
}

impl SimFabric {
    /// A fabric for `size` ranks.  Probabilities outside `[0, 1]` are
    /// clamped; use [`SimulatorConfig::validate`] to reject them instead.
    pub fn new(size: u32, config: SimulatorConfig) -> Self {
        let inner = FabricInner {
            ports: (0..size).map(|_| Port::default()).collect(),
            rng: StdRng::seed_from_u64(config.seed),
            loss_rate: probability(config.loss_rate),
            reorder_rate: probability(config.reorder_rate),
            duplicate_rate: probability(config.duplicate_rate),
            config,
            stats: SimStats::default(),
        };
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FabricInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self) -> u32 {
        self.lock().ports.len() as u32
    }

    /// Attach `rank` and join it to the group in one go.
    pub fn endpoint(&self, rank: Rank) -> Result<SimEndpoint, TransportError> {
        let mut ep = self.acquire_queue_pairs(rank)?;
        let address = self.lock().config.address;
        self.bring_up_multicast_group(&mut ep, address)?;
        Ok(ep)
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats.clone()
    }
}

impl GroupSetup for SimFabric {
    type Endpoint = SimEndpoint;

    fn probe_transport_address(&self, devices: &str) -> Result<IpAddr, TransportError> {
        let inner = self.lock();
        if devices.is_empty() || devices.split(',').any(|d| d.trim().starts_with("sim")) {
            return Ok(inner.config.address);
        }
        Err(TransportError::NoDevice(devices.to_string()))
    }

    fn acquire_queue_pairs(&self, rank: Rank) -> Result<SimEndpoint, TransportError> {
        self.lock().port(rank)?.attached = true;
        trace!("sim: rank {rank} attached");
        Ok(SimEndpoint {
            rank,
            fabric: self.clone(),
        })
    }

    fn bring_up_multicast_group(&self, ep: &mut SimEndpoint, group: IpAddr) -> Result<(), TransportError> {
        self.lock().port(ep.rank)?.joined = true;
        debug!("sim: rank {} joined multicast group {group}", ep.rank);
        Ok(())
    }

    fn teardown_communicator(&self, ep: SimEndpoint) -> Result<(), TransportError> {
        let mut inner = self.lock();
        let port = inner.port(ep.rank)?;
        *port = Port::default();
        debug!("sim: rank {} left the group", ep.rank);
        Ok(())
    }
}

/// One rank's queue pair and control channel on a [`SimFabric`].
#[derive(Debug)]
pub struct SimEndpoint {
    rank: Rank,
    fabric: SimFabric,
}

impl SimEndpoint {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Make the next `post_send` fail.
    pub fn fail_next_send(&mut self) {
        if let Ok(port) = self.fabric.lock().port(self.rank) {
            port.fail_next_send = true;
        }
    }

    /// Lose the next `count` multicast frames addressed to this endpoint.
    pub fn drop_next_incoming(&mut self, count: usize) {
        if let Ok(port) = self.fabric.lock().port(self.rank) {
            port.drop_incoming += count;
        }
    }

    /// Land a frame carrying `psn` and `payload` directly in this
    /// endpoint's receive queue.  Returns `false` when no buffer was posted.
    pub fn inject_recv(&mut self, psn: u32, payload: &[u8]) -> bool {
        let mut bytes = vec![0u8; GRH_LENGTH];
        bytes.extend_from_slice(payload);
        let frame = Frame {
            imm_data: crate::packet::encode_imm(psn),
            bytes,
        };
        match self.fabric.lock().port(self.rank) {
            Ok(port) => port.land(&frame),
            Err(_) => false,
        }
    }
}

impl McastTransport for SimEndpoint {
    fn post_send(&mut self, wr: &SendWorkRequest<'_>) -> Result<(), TransportError> {
        let mut inner = self.fabric.lock();
        let max_inline = inner.config.max_inline;
        let port = inner.port(self.rank)?;
        if !port.attached {
            return Err(TransportError::PostSend(-1));
        }
        if std::mem::take(&mut port.fail_next_send) {
            return Err(TransportError::PostSend(-5));
        }
        if wr.inline && wr.payload.len() > max_inline {
            return Err(TransportError::InlineTooLarge {
                len: wr.payload.len(),
                max: max_inline,
            });
        }
        if wr.signaled {
            port.send_cq.push_back(SendCompletion {
                wr_id: wr.wr_id,
                status: WcStatus::Success,
            });
        }
        if wr.inline {
            inner.stats.inline_sends += 1;
        }

        let mut bytes = vec![0u8; GRH_LENGTH + wr.payload.len()];
        bytes[GRH_LENGTH..].copy_from_slice(wr.payload);
        inner.multicast(
            self.rank,
            Frame {
                imm_data: wr.imm_data,
                bytes,
            },
        );
        Ok(())
    }

    fn post_recv(&mut self, wrs: Vec<(u64, Vec<u8>)>) -> Result<(), TransportError> {
        let mut inner = self.fabric.lock();
        let port = inner.port(self.rank)?;
        if !port.attached {
            return Err(TransportError::PostRecv(-1));
        }
        port.posted.extend(wrs);
        Ok(())
    }

    fn poll_send_cq(&mut self, max: usize) -> Result<Vec<SendCompletion>, TransportError> {
        let mut inner = self.fabric.lock();
        let port = inner.port(self.rank)?;
        let n = max.min(port.send_cq.len());
        Ok(port.send_cq.drain(..n).collect())
    }

    fn poll_recv_cq(&mut self, max: usize) -> Result<Vec<RecvCompletion>, TransportError> {
        let mut inner = self.fabric.lock();
        let FabricInner { ports, stats, .. } = &mut *inner;
        let port = ports
            .get_mut(self.rank as usize)
            .ok_or(TransportError::BadRank(self.rank))?;
        // A held frame stops waiting once its receiver runs dry.
        if port.recv_cq.is_empty() {
            if let Some(held) = port.held.take() {
                deliver(port, &held, stats);
            }
        }
        let n = max.min(port.recv_cq.len());
        Ok(port.recv_cq.drain(..n).collect())
    }
}

impl ControlChannel for SimEndpoint {
    fn send_to(&mut self, peer: Rank, bytes: Vec<u8>) -> Result<(), TransportError> {
        let mut inner = self.fabric.lock();
        let port = inner.port(peer).map_err(|_| TransportError::Unreachable(peer))?;
        port.inbox.push_back((self.rank, bytes));
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<(Rank, Vec<u8>)>, TransportError> {
        Ok(self.fabric.lock().port(self.rank)?.inbox.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::decode_imm;

    fn send(ep: &mut SimEndpoint, psn: u32, payload: &[u8]) {
        let wr = SendWorkRequest {
            wr_id: 1,
            imm_data: crate::packet::encode_imm(psn),
            payload,
            lkey: 0,
            inline: false,
            signaled: true,
        };
        ep.post_send(&wr).unwrap();
    }

    fn post(ep: &mut SimEndpoint, n: u64) {
        ep.post_recv((0..n).map(|i| (i, vec![0u8; GRH_LENGTH + 8])).collect())
            .unwrap();
    }

    #[test]
    fn multicast_reaches_every_other_member() {
        let fabric = SimFabric::new(3, SimulatorConfig::default());
        let mut eps: Vec<_> = (0..3).map(|r| fabric.endpoint(r).unwrap()).collect();
        for ep in eps.iter_mut() {
            post(ep, 2);
        }
        send(&mut eps[0], 7, b"abc");
        assert!(eps[0].poll_recv_cq(4).unwrap().is_empty(), "no loopback");
        for ep in &mut eps[1..] {
            let wcs = ep.poll_recv_cq(4).unwrap();
            assert_eq!(wcs.len(), 1);
            assert_eq!(decode_imm(wcs[0].imm_data), 7);
            assert_eq!(&wcs[0].buf[GRH_LENGTH..wcs[0].byte_len], b"abc");
        }
        assert_eq!(eps[0].poll_send_cq(4).unwrap().len(), 1);
    }

    #[test]
    fn no_posted_buffer_drops_silently() {
        let fabric = SimFabric::new(2, SimulatorConfig::default());
        let mut a = fabric.endpoint(0).unwrap();
        let mut b = fabric.endpoint(1).unwrap();
        send(&mut a, 0, b"x");
        post(&mut b, 1);
        assert!(b.poll_recv_cq(1).unwrap().is_empty());
        assert_eq!(fabric.stats().no_buffer, 1);
    }

    #[test]
    fn oversized_frame_completes_with_length_error() {
        let fabric = SimFabric::new(2, SimulatorConfig::default());
        let mut a = fabric.endpoint(0).unwrap();
        let mut b = fabric.endpoint(1).unwrap();
        post(&mut b, 1);
        send(&mut a, 0, &[0u8; 16]);
        let wcs = b.poll_recv_cq(1).unwrap();
        assert_eq!(wcs[0].status, WcStatus::LocalLengthError);
    }

    #[test]
    fn inline_limit_is_enforced() {
        let config = SimulatorConfig {
            max_inline: 2,
            ..SimulatorConfig::default()
        };
        let fabric = SimFabric::new(2, config);
        let mut a = fabric.endpoint(0).unwrap();
        let wr = SendWorkRequest {
            wr_id: 1,
            imm_data: 0,
            payload: b"abc",
            lkey: 0,
            inline: true,
            signaled: false,
        };
        assert_eq!(
            a.post_send(&wr),
            Err(TransportError::InlineTooLarge { len: 3, max: 2 })
        );
    }

    #[test]
    fn total_loss_drops_everything() {
        let config = SimulatorConfig {
            loss_rate: 1.0,
            ..SimulatorConfig::default()
        };
        let fabric = SimFabric::new(2, config);
        let mut a = fabric.endpoint(0).unwrap();
        let mut b = fabric.endpoint(1).unwrap();
        post(&mut b, 4);
        for psn in 0..4 {
            send(&mut a, psn, b"x");
        }
        assert!(b.poll_recv_cq(4).unwrap().is_empty());
        assert_eq!(fabric.stats().dropped, 4);
    }

    #[test]
    fn held_frame_is_overtaken() {
        let config = SimulatorConfig {
            reorder_rate: 1.0,
            ..SimulatorConfig::default()
        };
        let fabric = SimFabric::new(2, config);
        let mut a = fabric.endpoint(0).unwrap();
        let mut b = fabric.endpoint(1).unwrap();
        post(&mut b, 4);
        send(&mut a, 0, b"x");
        send(&mut a, 1, b"y");
        // psn 0 is held until psn 1 has landed.
        let psns: Vec<u32> = b
            .poll_recv_cq(4)
            .unwrap()
            .iter()
            .map(|wc| decode_imm(wc.imm_data))
            .collect();
        assert_eq!(psns, vec![1, 0]);
    }

    #[test]
    fn same_seed_same_faults() {
        let run = || {
            let config = SimulatorConfig {
                loss_rate: 0.3,
                duplicate_rate: 0.2,
                seed: 42,
                ..SimulatorConfig::default()
            };
            let fabric = SimFabric::new(2, config);
            let mut a = fabric.endpoint(0).unwrap();
            let mut b = fabric.endpoint(1).unwrap();
            post(&mut b, 64);
            for psn in 0..32 {
                send(&mut a, psn, b"x");
            }
            b.poll_recv_cq(64)
                .unwrap()
                .iter()
                .map(|wc| decode_imm(wc.imm_data))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn control_channel_is_ordered_per_peer() {
        let fabric = SimFabric::new(2, SimulatorConfig::default());
        let mut a = fabric.endpoint(0).unwrap();
        let mut b = fabric.endpoint(1).unwrap();
        a.send_to(1, vec![1]).unwrap();
        a.send_to(1, vec![2]).unwrap();
        assert_eq!(b.try_recv().unwrap(), Some((0, vec![1])));
        assert_eq!(b.try_recv().unwrap(), Some((0, vec![2])));
        assert_eq!(b.try_recv().unwrap(), None);
        assert_eq!(a.send_to(5, vec![]), Err(TransportError::Unreachable(5)));
    }

    #[test]
    fn probe_and_teardown() {
        let fabric = SimFabric::new(2, SimulatorConfig::default());
        assert!(fabric.probe_transport_address("sim0").is_ok());
        assert!(matches!(
            fabric.probe_transport_address("mlx5_0"),
            Err(TransportError::NoDevice(_))
        ));
        assert!(matches!(fabric.acquire_queue_pairs(2), Err(TransportError::BadRank(2))));

        let mut a = fabric.endpoint(0).unwrap();
        let b = fabric.endpoint(1).unwrap();
        fabric.teardown_communicator(b).unwrap();
        send(&mut a, 0, b"x");
        assert_eq!(fabric.stats().frames_delivered, 0);
    }

    #[test]
    fn bad_probability_is_rejected() {
        let config = SimulatorConfig {
            reorder_rate: 1.5,
            ..SimulatorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BadProbability { name: "reorder_rate", .. })
        ));
    }
}
