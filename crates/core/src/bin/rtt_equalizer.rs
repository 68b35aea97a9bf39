//! Delay engine demo over a simulated link.
//!
//! Packets leaving the outbound queue travel a simulated path with a fixed base
//! RTT plus random jitter and come back through the inbound queue. The engine
//! probes the path, steers the injected delay for the chosen mode and logs its
//! status once per second next to the RTT observed by data packets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rtt_equalizer::delay::{ChannelSink, PeerLatencyTable};
use rtt_equalizer::{
    ConfigArgs, ConnectionPhase, DelayEngine, Direction, PacketKind, ProbeId, TimeSource,
};

const MATCHED_PEER: &str = "remote";

#[derive(Parser, Debug)]
#[command(name = "rtt-equalizer")]
#[command(about = "Inject latency into a simulated link and steer its round-trip time")]
struct Args {
    #[command(subcommand)]
    mode: ModeCommand,

    /// Base round-trip time of the simulated link (ms)
    #[arg(long, default_value = "40", env = "RTT_EQ_BASE_RTT_MS")]
    base_rtt_ms: u64,

    /// Maximum random deviation from the base RTT per packet (ms)
    #[arg(long, default_value = "3")]
    jitter_ms: u64,

    /// Interval between simulated data packets (ms)
    #[arg(long, default_value = "100")]
    data_interval_ms: u64,

    /// How long to run; 0 runs until interrupted
    #[arg(long, default_value = "10")]
    duration_secs: u64,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Subcommand, Debug, Clone)]
enum ModeCommand {
    /// No artificial delay
    Off,
    /// Add a fixed round-trip delay
    Add {
        #[arg(allow_negative_numbers = true)]
        amount_ms: i64,
    },
    /// Steer the round-trip time to a fixed total
    Total {
        #[arg(allow_negative_numbers = true)]
        target_ms: i64,
    },
    /// Steer the round-trip time to a simulated peer's reported latency
    Match { peer_latency_ms: u64 },
}

#[derive(Debug, Clone, Copy)]
enum LinkPacket {
    Probe(ProbeId),
    Data { sent_at_ms: u64 },
}

fn main() -> anyhow::Result<()> {
    rtt_equalizer::tracing::set_logger(None);
    let args = Args::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    rt.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = args.config.clone().build()?;
    debug!(?config, "Loaded delay configuration");

    let peers = Arc::new(PeerLatencyTable::new());
    let (wire_tx, wire_rx) = mpsc::unbounded_channel();
    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(DelayEngine::start(
        &config,
        peers.clone(),
        ChannelSink::new(Direction::Outbound, wire_tx),
        ChannelSink::new(Direction::Inbound, app_tx),
    ));

    match args.mode {
        ModeCommand::Off => engine.set_off(),
        ModeCommand::Add { amount_ms } => engine.set_add(amount_ms),
        ModeCommand::Total { target_ms } => engine.set_total(target_ms),
        ModeCommand::Match { peer_latency_ms } => {
            peers.report(MATCHED_PEER, peer_latency_ms);
            engine.set_match(MATCHED_PEER);
        }
    }
    info!(
        mode = %engine.mode(),
        base_rtt_ms = args.base_rtt_ms,
        jitter_ms = args.jitter_ms,
        "Simulated link up"
    );

    let observed_rtt = Arc::new(AtomicU64::new(0));
    let wire = tokio::spawn(simulate_link(
        engine.clone(),
        wire_rx,
        args.base_rtt_ms,
        args.jitter_ms,
    ));
    let app = tokio::spawn(receive_upstream(
        engine.clone(),
        app_rx,
        observed_rtt.clone(),
    ));

    let mut tick = tokio::time::interval(config.tick_interval);
    let mut data = tokio::time::interval(Duration::from_millis(args.data_interval_ms.max(1)));
    let mut report = tokio::time::interval(Duration::from_secs(1));
    let deadline = (args.duration_secs > 0)
        .then(|| tokio::time::Instant::now() + Duration::from_secs(args.duration_secs));
    let stop = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Some(id) = engine.tick() {
                    engine.send_probe(id, LinkPacket::Probe(id))?;
                    engine.on_probe_actually_sent(id);
                }
            }
            _ = data.tick() => {
                let sent_at_ms = engine.time_source().now_millis();
                engine.send(LinkPacket::Data { sent_at_ms }, PacketKind::Data)?;
            }
            _ = report.tick() => {
                info!(
                    observed_rtt_ms = observed_rtt.load(Ordering::Relaxed),
                    "{}",
                    engine.status_summary()
                );
            }
            _ = &mut stop => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    engine.on_phase_change(ConnectionPhase::Closing);
    engine.shutdown().await;
    let stats = engine.stats();
    info!(
        samples = stats.samples_taken,
        stale = stats.stale_results,
        pruned = stats.probes_pruned,
        "Final status: {}",
        stats.summary()
    );
    drop(engine);
    let _ = tokio::join!(wire, app);
    Ok(())
}

/// Echoes every outbound packet back into the inbound queue after a jittered
/// base round trip.
async fn simulate_link(
    engine: Arc<DelayEngine<LinkPacket>>,
    mut wire_rx: mpsc::UnboundedReceiver<LinkPacket>,
    base_rtt_ms: u64,
    jitter_ms: u64,
) {
    let mut rng = SmallRng::from_entropy();
    let jitter = jitter_ms as i64;
    while let Some(packet) = wire_rx.recv().await {
        let rtt_ms = (base_rtt_ms as i64 + rng.gen_range(-jitter..=jitter)).max(0) as u64;
        let engine = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(rtt_ms)).await;
            if let Err(error) = engine.receive(packet, PacketKind::Data) {
                debug!(%error, "Link closed before packet returned");
            }
        });
    }
}

async fn receive_upstream(
    engine: Arc<DelayEngine<LinkPacket>>,
    mut app_rx: mpsc::UnboundedReceiver<LinkPacket>,
    observed_rtt: Arc<AtomicU64>,
) {
    while let Some(packet) = app_rx.recv().await {
        let now_ms = engine.time_source().now_millis();
        match packet {
            LinkPacket::Probe(id) => {
                engine.on_probe_arrived(id);
                match engine.on_probe_result(id, now_ms) {
                    Some(sample) => debug!(
                        probe_id = %id,
                        measured_rtt_ms = sample.measured_rtt_ms,
                        base_ms = sample.estimated_base_ms,
                        "Probe returned"
                    ),
                    None => warn!(probe_id = %id, "Probe returned after it was dropped"),
                }
            }
            LinkPacket::Data { sent_at_ms } => {
                observed_rtt.store(now_ms.saturating_sub(sent_at_ms), Ordering::Relaxed);
            }
        }
    }
}
