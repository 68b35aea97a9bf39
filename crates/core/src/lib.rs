/// Delay engine configuration.
pub mod config;

/// Latency injection: delay control, probes and per-direction release queues.
pub mod delay;

/// Clock and timer abstraction, real and virtual.
pub mod time;

/// Tracing and logging setup.
pub mod tracing;

pub use config::{ConfigArgs, DelayConfig, DelaySplit};
pub use delay::{
    ConnectionPhase, DelayEngine, DelayError, DelayMode, DelayStats, Direction, PacketKind,
    PacketSink, ProbeId,
};
pub use time::{RealTime, TimeSource, VirtualTime};
