//! Delay controller: active mode, injected delay and base-RTT estimation.
//!
//! The injected delay is kept in an atomic so both direction schedulers can
//! read it without locking on every packet. Everything else (mode, base
//! estimator, match smoother) is only touched by the control surface and sits
//! behind a mutex.
//!
//! All instants are milliseconds on the owning engine's clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{DelayConfig, DelaySplit};

use super::mode::DelayMode;
use super::peers::PeerLatency;
use super::probe::{PendingProbe, ProbeCorrelator, ProbeId};
use super::smoother::{MatchSmoother, SmootherParams};
use super::stats::DelayStats;
use super::Direction;

/// Outcome of one control step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recompute {
    /// Combined injected delay after this step.
    pub delay_ms: u64,
    /// The caller should send a new probe.
    pub probe_requested: bool,
}

/// A processed probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseSample {
    pub measured_rtt_ms: u64,
    pub estimated_base_ms: u64,
}

struct ControlState {
    mode: DelayMode,
    last_valid_base_ms: Option<u64>,
    smoothed_base_ms: f64,
    last_base_sample_ms: Option<u64>,
    awaiting_base: bool,
    last_probe_request_ms: Option<u64>,
    matcher: MatchSmoother,
}

impl ControlState {
    fn base_age_ms(&self, now_ms: u64) -> Option<u64> {
        self.last_base_sample_ms
            .map(|sampled| now_ms.saturating_sub(sampled))
    }
}

pub struct DelayState {
    delay_ms: AtomicU64,
    control: Mutex<ControlState>,
    probes: ProbeCorrelator,
    peers: Arc<dyn PeerLatency>,
    split: DelaySplit,
    freshness_window_ms: u64,
    probe_cooldown_ms: u64,
    probe_timeout_ms: u64,
    base_smoothing: f64,
    samples_taken: AtomicU64,
    stale_results: AtomicU64,
    probes_pruned: AtomicU64,
}

impl DelayState {
    pub fn new(config: &DelayConfig, peers: Arc<dyn PeerLatency>) -> Self {
        Self {
            delay_ms: AtomicU64::new(0),
            control: Mutex::new(ControlState {
                mode: DelayMode::Off,
                last_valid_base_ms: None,
                smoothed_base_ms: 0.0,
                last_base_sample_ms: None,
                awaiting_base: false,
                last_probe_request_ms: None,
                matcher: MatchSmoother::new(SmootherParams::from(config)),
            }),
            probes: ProbeCorrelator::new(),
            peers,
            split: config.split,
            freshness_window_ms: config.freshness_window.as_millis() as u64,
            probe_cooldown_ms: config.probe_cooldown.as_millis() as u64,
            probe_timeout_ms: config.probe_timeout.as_millis() as u64,
            base_smoothing: config.base_smoothing,
            samples_taken: AtomicU64::new(0),
            stale_results: AtomicU64::new(0),
            probes_pruned: AtomicU64::new(0),
        }
    }

    // =========================================================================
    // Mode control
    // =========================================================================

    /// Switches the active mode.
    ///
    /// `Off` zeroes the delay, forgets pending probes and stops waiting for a
    /// base sample. `Add` applies its amount immediately. `Total` and `Match`
    /// keep the current delay until a fresh base sample is available.
    pub fn set_mode(&self, mode: DelayMode) {
        let mut control = self.control.lock();
        if control.mode != mode {
            control.matcher.reset();
            tracing::debug!(from = %control.mode, to = %mode, "Switching delay mode");
        }
        match &mode {
            DelayMode::Off => {
                self.probes.clear();
                control.awaiting_base = false;
                self.store_delay(0);
            }
            DelayMode::Add { amount_ms } => self.store_delay(*amount_ms),
            DelayMode::Total { .. } | DelayMode::Match { .. } => {}
        }
        control.mode = mode;
    }

    pub fn mode(&self) -> DelayMode {
        self.control.lock().mode.clone()
    }

    // =========================================================================
    // Delay reads (lock-free)
    // =========================================================================

    /// Combined injected round-trip delay.
    pub fn current_delay(&self) -> u64 {
        self.delay_ms.load(Ordering::Acquire)
    }

    pub fn current_outbound_delay(&self) -> u64 {
        self.split.split(self.current_delay()).0
    }

    pub fn current_inbound_delay(&self) -> u64 {
        self.split.split(self.current_delay()).1
    }

    pub fn delay_for(&self, direction: Direction) -> u64 {
        let (outbound, inbound) = self.split.split(self.current_delay());
        match direction {
            Direction::Outbound => outbound,
            Direction::Inbound => inbound,
        }
    }

    fn store_delay(&self, delay_ms: u64) {
        let previous = self.delay_ms.swap(delay_ms, Ordering::AcqRel);
        if previous != delay_ms {
            tracing::trace!(previous_ms = previous, delay_ms, "Injected delay updated");
        }
    }

    // =========================================================================
    // Control step
    // =========================================================================

    /// Recomputes the injected delay for the active mode.
    ///
    /// RTT-driven modes only act on a fresh base sample. With a stale or
    /// missing sample the delay is left as it is and a probe is requested,
    /// at most once per cooldown window.
    pub fn recompute(&self, now_ms: u64) -> Recompute {
        let mut control = self.control.lock();
        let mode = control.mode.clone();
        let delay_ms = match mode {
            DelayMode::Off => 0,
            DelayMode::Add { amount_ms } => amount_ms,
            DelayMode::Total { .. } | DelayMode::Match { .. } => {
                let fresh_base = match (control.base_age_ms(now_ms), control.last_valid_base_ms) {
                    (Some(age), Some(base)) if age <= self.freshness_window_ms => Some(base),
                    _ => None,
                };
                let Some(base) = fresh_base else {
                    let probe_requested = self.request_probe(&mut control, now_ms);
                    return Recompute {
                        delay_ms: self.current_delay(),
                        probe_requested,
                    };
                };
                let target = match &mode {
                    DelayMode::Total { target_ms } if *target_ms > 0 => *target_ms,
                    DelayMode::Match { peer_id } => match self.peers.latency_ms(peer_id) {
                        Some(raw) => control.matcher.update(raw, now_ms),
                        None => {
                            tracing::trace!(peer = %peer_id, "Matched peer latency unavailable");
                            base
                        }
                    },
                    _ => base,
                };
                target.saturating_sub(base)
            }
        };
        self.store_delay(delay_ms);
        Recompute {
            delay_ms,
            probe_requested: false,
        }
    }

    fn request_probe(&self, control: &mut ControlState, now_ms: u64) -> bool {
        let cooled_down = control
            .last_probe_request_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.probe_cooldown_ms);
        if !cooled_down {
            return false;
        }
        control.last_probe_request_ms = Some(now_ms);
        control.awaiting_base = true;
        true
    }

    // =========================================================================
    // Probe hooks
    // =========================================================================

    /// Records a probe about to be sent, with the delay portions it will get.
    /// Serialized with mode switches under the control lock.
    pub fn on_probe_sent(&self, id: ProbeId, now_ms: u64) {
        let _control = self.control.lock();
        let delay = self.current_delay();
        let (outbound, inbound) = self.split.split(delay);
        self.probes
            .insert(id, PendingProbe::new(now_ms, delay, outbound, inbound));
        tracing::trace!(probe_id = %id, outbound, inbound, "Probe registered");
    }

    pub fn on_probe_actually_sent(&self, id: ProbeId, now_ms: u64) -> bool {
        self.probes.mark_sent(id, now_ms)
    }

    pub fn on_probe_arrived(&self, id: ProbeId, now_ms: u64) -> bool {
        self.probes.mark_arrived(id, now_ms)
    }

    /// Turns a probe result into a base-RTT sample.
    ///
    /// Unknown or already processed ids are stale and ignored.
    pub fn on_probe_result(&self, id: ProbeId, arrival_ms: u64, now_ms: u64) -> Option<BaseSample> {
        let Some(probe) = self.probes.take(id) else {
            self.stale_results.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(probe_id = %id, "Dropping stale probe result");
            return None;
        };
        let sample = BaseSample {
            measured_rtt_ms: probe.measured_rtt_ms(arrival_ms),
            estimated_base_ms: probe.estimated_base_ms(arrival_ms),
        };

        let mut control = self.control.lock();
        control.last_valid_base_ms = Some(sample.estimated_base_ms);
        let estimated = sample.estimated_base_ms as f64;
        control.smoothed_base_ms = if control.smoothed_base_ms == 0.0 {
            estimated
        } else {
            control.smoothed_base_ms * (1.0 - self.base_smoothing) + estimated * self.base_smoothing
        };
        control.last_base_sample_ms = Some(now_ms);
        control.awaiting_base = false;
        self.samples_taken.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            probe_id = %id,
            measured_rtt_ms = sample.measured_rtt_ms,
            applied_delay_ms = probe.applied_delay_ms,
            base_ms = sample.estimated_base_ms,
            smoothed_base_ms = control.smoothed_base_ms,
            "Base RTT sample"
        );
        Some(sample)
    }

    /// Drops pending probes whose reply never came back.
    pub fn prune_stale_probes(&self, now_ms: u64) -> usize {
        let pruned = self.probes.prune_older_than(now_ms, self.probe_timeout_ms);
        if pruned > 0 {
            self.probes_pruned
                .fetch_add(pruned as u64, Ordering::Relaxed);
            tracing::debug!(pruned, "Pruned unanswered probes");
        }
        pruned
    }

    pub fn pending_probes(&self) -> usize {
        self.probes.len()
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn last_valid_base(&self) -> Option<u64> {
        self.control.lock().last_valid_base_ms
    }

    pub fn smoothed_base(&self) -> Option<u64> {
        let smoothed = self.control.lock().smoothed_base_ms;
        (smoothed > 0.0).then(|| smoothed.round() as u64)
    }

    pub fn is_awaiting_base(&self) -> bool {
        self.control.lock().awaiting_base
    }

    pub fn stats(&self, now_ms: u64) -> DelayStats {
        let control = self.control.lock();
        let delay_ms = self.current_delay();
        let (outbound_delay_ms, inbound_delay_ms) = self.split.split(delay_ms);
        let base_sample_age_ms = control.base_age_ms(now_ms);
        DelayStats {
            mode: control.mode.clone(),
            delay_ms,
            outbound_delay_ms,
            inbound_delay_ms,
            last_base_ms: control.last_valid_base_ms,
            smoothed_base_ms: (control.smoothed_base_ms > 0.0)
                .then(|| control.smoothed_base_ms.round() as u64),
            base_sample_age_ms,
            base_fresh: base_sample_age_ms.is_some_and(|age| age <= self.freshness_window_ms),
            awaiting_base: control.awaiting_base,
            match_target_ms: control.matcher.current(),
            pending_probes: self.probes.len(),
            samples_taken: self.samples_taken.load(Ordering::Relaxed),
            stale_results: self.stale_results.load(Ordering::Relaxed),
            probes_pruned: self.probes_pruned.load(Ordering::Relaxed),
        }
    }
}
