//! Per-direction release queue.
//!
//! Each accepted packet is stamped with `now + delay` for its direction and
//! appended to a FIFO queue. The drain loop releases the head once its deadline
//! passes, busy-waits the last stretch when the deadline is within the
//! precision window, and otherwise hands back a re-arm deadline so the owner
//! can sleep on a coarse timer.
//!
//! A later packet never overtakes an earlier one, even when its own deadline
//! has already passed (the delay may have shrunk in between).

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::DelayConfig;
use crate::time::{TimeSource, NANOS_PER_MILLI};

use super::errors::SinkError;
use super::state::DelayState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Towards the transport.
    Outbound,
    /// Towards the application.
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketKind {
    /// Regular application traffic, delayed by the current direction portion.
    #[default]
    Data,
    /// Handshake or protocol phase transition. Never delayed.
    PhaseTransition,
}

/// Resolved with the sink's result once the packet leaves the queue.
pub type Completion = oneshot::Sender<Result<(), SinkError>>;

/// Where released packets go: the transport for outbound, the application for
/// inbound.
pub trait PacketSink: Send + 'static {
    type Packet: Send + 'static;

    fn deliver(&mut self, packet: Self::Packet) -> Result<(), SinkError>;
}

/// Sink forwarding released packets into an unbounded channel.
pub struct ChannelSink<P> {
    direction: Direction,
    tx: mpsc::UnboundedSender<P>,
}

impl<P> ChannelSink<P> {
    pub fn new(direction: Direction, tx: mpsc::UnboundedSender<P>) -> Self {
        Self { direction, tx }
    }
}

impl<P: Send + 'static> PacketSink for ChannelSink<P> {
    type Packet = P;

    fn deliver(&mut self, packet: P) -> Result<(), SinkError> {
        self.tx.send(packet).map_err(|_| SinkError::Closed {
            direction: self.direction,
        })
    }
}

pub struct QueuedPacket<P> {
    pub packet: P,
    pub completion: Option<Completion>,
    /// Monotonic release deadline in nanoseconds.
    pub release_at_nanos: u64,
}

/// Shared view of a scheduler owned by another task.
#[derive(Debug, Default)]
pub struct SchedulerStatus {
    draining: AtomicBool,
    queued: AtomicUsize,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl SchedulerStatus {
    /// Whether a drain step is currently running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Packets the sink refused.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn try_begin_drain(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn end_drain(&self) {
        self.draining.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    /// Delivered on the spot: no delay and nothing queued ahead.
    Delivered,
    Queued { release_at_nanos: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Queue is empty.
    Idle,
    /// The head is not due yet; drain again at this instant.
    Rearm { wake_at_nanos: u64 },
    /// Another drain step holds the single-flight flag.
    AlreadyDraining,
}

pub struct DelayScheduler<S: PacketSink, T: TimeSource> {
    direction: Direction,
    queue: VecDeque<QueuedPacket<S::Packet>>,
    state: Arc<DelayState>,
    sink: S,
    time_source: T,
    status: Arc<SchedulerStatus>,
    precision_window_nanos: u64,
    min_reschedule_nanos: u64,
}

impl<S: PacketSink, T: TimeSource> DelayScheduler<S, T> {
    pub fn new(
        direction: Direction,
        state: Arc<DelayState>,
        sink: S,
        time_source: T,
        config: &DelayConfig,
    ) -> Self {
        Self {
            direction,
            queue: VecDeque::new(),
            state,
            sink,
            time_source,
            status: Arc::new(SchedulerStatus::default()),
            precision_window_nanos: config.precision_window.as_nanos() as u64,
            min_reschedule_nanos: config.min_reschedule.as_nanos() as u64,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> Arc<SchedulerStatus> {
        self.status.clone()
    }

    pub fn time_source(&self) -> &T {
        &self.time_source
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Takes ownership of a packet. Never blocks.
    ///
    /// The delay is read from the shared state at this moment; later changes
    /// do not move the deadline of packets already queued.
    pub fn accept(
        &mut self,
        packet: S::Packet,
        kind: PacketKind,
        completion: Option<Completion>,
    ) -> Accepted {
        let delay_ms = match kind {
            PacketKind::Data => self.state.delay_for(self.direction),
            PacketKind::PhaseTransition => 0,
        };

        if delay_ms == 0 && self.queue.is_empty() {
            self.deliver(packet, completion);
            return Accepted::Delivered;
        }

        let release_at_nanos = self
            .time_source
            .now_nanos()
            .saturating_add(delay_ms.saturating_mul(NANOS_PER_MILLI));
        tracing::trace!(
            direction = %self.direction,
            delay_ms,
            ?kind,
            queued = self.queue.len() + 1,
            "Packet queued"
        );
        self.queue.push_back(QueuedPacket {
            packet,
            completion,
            release_at_nanos,
        });
        self.status.queued.store(self.queue.len(), Ordering::Release);
        Accepted::Queued { release_at_nanos }
    }

    /// Releases every due packet in order.
    ///
    /// Waits shorter than the precision window are spun through. Longer waits
    /// release the single-flight flag and return the instant at which drain
    /// should run again: the head deadline minus the precision window, but no
    /// sooner than the minimum reschedule interval.
    pub fn drain(&mut self) -> DrainOutcome {
        if !self.status.try_begin_drain() {
            return DrainOutcome::AlreadyDraining;
        }

        loop {
            let Some(head) = self.queue.front() else {
                self.status.end_drain();
                return DrainOutcome::Idle;
            };
            let now = self.time_source.now_nanos();
            let deadline = head.release_at_nanos;

            if now >= deadline {
                if let Some(entry) = self.queue.pop_front() {
                    self.status.queued.store(self.queue.len(), Ordering::Release);
                    self.deliver(entry.packet, entry.completion);
                }
                continue;
            }

            let remaining = deadline - now;
            if remaining <= self.precision_window_nanos {
                self.time_source.spin_until(deadline);
                continue;
            }

            self.status.end_drain();
            let wait = remaining
                .saturating_sub(self.precision_window_nanos)
                .max(self.min_reschedule_nanos);
            return DrainOutcome::Rearm {
                wake_at_nanos: now.saturating_add(wait),
            };
        }
    }

    /// Delivers everything still queued right away, ignoring deadlines, and
    /// resets the single-flight flag. Returns how many packets were released.
    pub fn flush(&mut self) -> usize {
        let flushed = self.queue.len();
        while let Some(entry) = self.queue.pop_front() {
            self.deliver(entry.packet, entry.completion);
        }
        self.status.queued.store(0, Ordering::Release);
        self.status.end_drain();
        if flushed > 0 {
            tracing::debug!(direction = %self.direction, flushed, "Flushed delay queue");
        }
        flushed
    }

    fn deliver(&mut self, packet: S::Packet, completion: Option<Completion>) {
        let result = self.sink.deliver(packet);
        match &result {
            Ok(()) => {
                self.status.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.status.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(direction = %self.direction, %error, "Failed delivering delayed packet");
            }
        }
        if let Some(completion) = completion {
            // The caller may have stopped waiting
            let _ = completion.send(result);
        }
    }
}
