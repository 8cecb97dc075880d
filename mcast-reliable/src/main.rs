//! Entry point for `mcast-reliable`.
//!
//! Runs a group of simulated ranks, one tokio task each, broadcasting a
//! pseudo-random buffer over the lossy in-process fabric, then checks every
//! receiver's copy.  `main.rs` owns only process setup (logging, argument
//! parsing, task spawning); all protocol work lives in the library.

use anyhow::{bail, Context};
use clap::Parser;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use mcast_reliable::simulator::{SimFabric, SimulatorConfig};
use mcast_reliable::{CommConfig, CommStats, Communicator, GroupSetup, MemoryRegion, Rank, TreeLinks};

/// Reliable broadcast over a simulated lossy multicast fabric.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Number of ranks in the group.
    #[arg(short = 'n', long, default_value_t = 4)]
    ranks: u32,
    /// Broadcast root.
    #[arg(long, default_value_t = 0)]
    root: Rank,
    /// Bytes per broadcast.
    #[arg(short, long, default_value_t = 1 << 20)]
    size: usize,
    /// Broadcasts to run back to back.
    #[arg(short, long, default_value_t = 4)]
    iterations: usize,
    /// Probability a frame is lost on the way to one receiver.
    #[arg(long, default_value_t = 0.01)]
    loss: f64,
    /// Probability a frame is reordered.
    #[arg(long, default_value_t = 0.01)]
    reorder: f64,
    /// Probability a frame is duplicated.
    #[arg(long, default_value_t = 0.0)]
    duplicate: f64,
    /// Seed for fault injection and payload generation.
    #[arg(long, default_value_t = 1)]
    seed: u64,
    /// Transport devices to probe.
    #[arg(long, default_value = "sim0")]
    devices: String,
    /// Receive window size; overrides MCAST_WSIZE.
    #[arg(long)]
    wsize: Option<usize>,
    /// Maximum payload bytes per packet; overrides MCAST_MAX_PER_PACKET.
    #[arg(long)]
    max_per_packet: Option<usize>,
}

impl Cli {
    fn comm_config(&self) -> anyhow::Result<CommConfig> {
        let mut config = CommConfig::from_env()?;
        if let Some(wsize) = self.wsize {
            config.wsize = wsize;
        }
        if let Some(mpp) = self.max_per_packet {
            config.max_per_packet = mpp;
            config.max_inline = config.max_inline.min(mpp);
        }
        config.validate()?;
        Ok(config)
    }

    fn sim_config(&self) -> anyhow::Result<SimulatorConfig> {
        let config = SimulatorConfig {
            loss_rate: self.loss,
            reorder_rate: self.reorder,
            duplicate_rate: self.duplicate,
            seed: self.seed,
            ..SimulatorConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}

fn payload(seed: u64, iteration: usize, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed ^ (iteration as u64).rotate_left(32));
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    buf
}

/// Drive one rank through every broadcast.
async fn run_rank(fabric: SimFabric, rank: Rank, cli: std::sync::Arc<Cli>, config: CommConfig) -> anyhow::Result<CommStats> {
    let address = fabric.probe_transport_address(&cli.devices)?;
    let mut ep = fabric.acquire_queue_pairs(rank)?;
    fabric.bring_up_multicast_group(&mut ep, address)?;

    let mut comm = Communicator::new(rank, cli.ranks, 1, config, ep)?;
    comm.prepost()?;

    for iteration in 0..cli.iterations {
        let expected = payload(cli.seed, iteration, cli.size);
        let mut buf = if rank == cli.root {
            expected.clone()
        } else {
            vec![0u8; cli.size]
        };
        let mr = MemoryRegion::new(rank, buf.len());
        let links = TreeLinks::binomial(rank, cli.root, cli.ranks);
        let mut req = comm.init_bcast(&mut buf, cli.root, mr, links)?;

        let mut steps = 0u64;
        while !comm.bcast_progress(&mut req)?.is_complete() {
            steps += 1;
            tokio::task::yield_now().await;
        }
        debug!("rank {rank}: iteration {iteration} done after {steps} steps");

        if buf != expected {
            bail!("rank {rank}: iteration {iteration} delivered corrupt data");
        }
    }

    let stats = comm.stats().clone();
    fabric.teardown_communicator(comm.into_transport())?;
    Ok(stats)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();
    if cli.root >= cli.ranks {
        bail!("root {} is outside a group of {} ranks", cli.root, cli.ranks);
    }
    let config = cli.comm_config().context("invalid communicator configuration")?;
    let fabric = SimFabric::new(cli.ranks, cli.sim_config().context("invalid fault model")?);
    info!(
        "broadcasting {} bytes from rank {} to {} ranks, {} iterations",
        cli.size, cli.root, cli.ranks, cli.iterations
    );

    let cli = std::sync::Arc::new(cli);
    let handles: Vec<_> = (0..cli.ranks)
        .map(|rank| tokio::spawn(run_rank(fabric.clone(), rank, cli.clone(), config.clone())))
        .collect();

    for (rank, handle) in handles.into_iter().enumerate() {
        let stats = handle
            .await
            .with_context(|| format!("rank {rank} task panicked"))??;
        info!(
            "rank {rank}: rounds {}, sent {}, delivered {}, nacks {}, retransmits {}, duplicates {}",
            stats.rounds,
            stats.packets_sent,
            stats.packets_delivered,
            stats.nacks_sent,
            stats.retransmits,
            stats.duplicates
        );
    }
    info!("all ranks verified; fabric {:?}", fabric.stats());
    Ok(())
}
