//! Latency injection for a single connection.
//!
//! The engine adds a controlled amount of round-trip delay to a connection so
//! that its observed RTT either grows by a fixed amount, reaches a fixed total,
//! or tracks the latency another peer reports.
//!
//! ## Pieces
//!
//! - [`DelayState`]: active mode, injected delay and base-RTT estimation. The
//!   delay is split in two portions, one per direction.
//! - [`ProbeCorrelator`]: in-flight probes with the delay they were sent
//!   under, so the base RTT can be recovered after the delay changed.
//! - [`DelayScheduler`]: per-direction FIFO release queue, drained with a
//!   coarse timer followed by a short busy-wait.
//! - [`DelayEngine`]: the per-connection context tying them together and
//!   exposing the control surface.
//!
//! ## Control loop
//!
//! A periodic [`DelayEngine::tick`] recomputes the delay. RTT-driven modes
//! (`Total`, `Match`) need a fresh base sample; without one the delay is left
//! as is and the tick asks the host for a probe. The probe travels through the
//! outbound queue like any other packet and its reply through the inbound
//! queue, and [`DelayEngine::on_probe_result`] turns it into a new base sample.

mod engine;
mod errors;
mod mode;
mod peers;
mod probe;
mod scheduler;
mod smoother;
mod state;
mod stats;
mod task;

pub use engine::{ConnectionPhase, DelayEngine};
pub use errors::{DelayError, SinkError};
pub use mode::DelayMode;
pub use peers::{NoPeers, PeerLatency, PeerLatencyTable};
pub use probe::{PendingProbe, ProbeCorrelator, ProbeId};
pub use scheduler::{
    Accepted, ChannelSink, Completion, DelayScheduler, Direction, DrainOutcome, PacketKind,
    PacketSink, QueuedPacket, SchedulerStatus,
};
pub use state::{BaseSample, DelayState, Recompute};
pub use stats::DelayStats;
pub use task::SchedulerHandle;
