//! Correlation of in-flight probes with the delay that was applied to them.
//!
//! A probe's reply may come back after the injected delay has changed, so the
//! outbound/inbound portions in effect when the probe was sent are captured
//! at send time and subtracted from the measured round trip when its result
//! is processed.

use std::fmt;

use dashmap::DashMap;

/// Identifier of a probe: the monotonic timestamp (nanoseconds) at which it
/// was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(u64);

impl ProbeId {
    pub fn new(timestamp_nanos: u64) -> Self {
        Self(timestamp_nanos)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timing marks and delay snapshot of one in-flight probe.
///
/// All instants are milliseconds on the engine's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingProbe {
    /// When the probe was handed to the engine.
    pub created_at_ms: u64,
    /// Combined injected delay in effect at send time.
    pub applied_delay_ms: u64,
    pub outbound_delay_ms: u64,
    pub inbound_delay_ms: u64,
    /// When the probe entered the outbound pipeline.
    pub actual_send_ms: Option<u64>,
    /// Arrival mark set by the host. Bookkeeping only; the round trip is
    /// measured against the arrival reported with the result.
    pub arrival_ms: Option<u64>,
}

impl PendingProbe {
    pub fn new(created_at_ms: u64, applied_delay_ms: u64, outbound: u64, inbound: u64) -> Self {
        Self {
            created_at_ms,
            applied_delay_ms,
            outbound_delay_ms: outbound,
            inbound_delay_ms: inbound,
            actual_send_ms: None,
            arrival_ms: None,
        }
    }

    /// Measured round trip for a reply reported at `arrival_ms`.
    ///
    /// The outbound pipeline mark takes precedence over the creation time.
    pub fn measured_rtt_ms(&self, arrival_ms: u64) -> u64 {
        let sent = self.actual_send_ms.unwrap_or(self.created_at_ms);
        arrival_ms.saturating_sub(sent)
    }

    /// Round trip with the injected delay of this probe removed.
    pub fn estimated_base_ms(&self, arrival_ms: u64) -> u64 {
        self.measured_rtt_ms(arrival_ms)
            .saturating_sub(self.outbound_delay_ms + self.inbound_delay_ms)
    }
}

/// Concurrent table of in-flight probes.
///
/// Touched from the probe-send hook, both pipeline timing hooks and the result
/// hook, which may all run on different tasks.
#[derive(Debug, Default)]
pub struct ProbeCorrelator {
    pending: DashMap<ProbeId, PendingProbe>,
}

impl ProbeCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a probe. A duplicate id replaces the earlier record.
    pub fn insert(&self, id: ProbeId, probe: PendingProbe) {
        if self.pending.insert(id, probe).is_some() {
            tracing::debug!(probe_id = %id, "Probe id reused, replacing pending record");
        }
    }

    /// Stamps the time the probe entered the outbound pipeline. Returns
    /// `false` for unknown ids.
    pub fn mark_sent(&self, id: ProbeId, at_ms: u64) -> bool {
        match self.pending.get_mut(&id) {
            Some(mut probe) => {
                probe.actual_send_ms = Some(at_ms);
                true
            }
            None => false,
        }
    }

    /// Stamps the reply's arrival mark. Returns `false` for unknown ids.
    pub fn mark_arrived(&self, id: ProbeId, at_ms: u64) -> bool {
        match self.pending.get_mut(&id) {
            Some(mut probe) => {
                probe.arrival_ms = Some(at_ms);
                true
            }
            None => false,
        }
    }

    /// Removes and returns a probe. Each probe can be taken at most once.
    pub fn take(&self, id: ProbeId) -> Option<PendingProbe> {
        self.pending.remove(&id).map(|(_, probe)| probe)
    }

    pub fn contains(&self, id: ProbeId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Removes probes created more than `max_age_ms` before `now_ms`.
    /// Returns how many were removed.
    pub fn prune_older_than(&self, now_ms: u64, max_age_ms: u64) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, probe| now_ms.saturating_sub(probe.created_at_ms) <= max_age_ms);
        before.saturating_sub(self.pending.len())
    }

    pub fn clear(&self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_estimated_base_subtracts_applied_delay() {
        let mut probe = PendingProbe::new(1_000, 40, 20, 20);
        probe.actual_send_ms = Some(1_000);
        assert_eq!(probe.measured_rtt_ms(1_120), 120);
        assert_eq!(probe.estimated_base_ms(1_120), 80);
    }

    #[test]
    fn test_estimated_base_never_negative() {
        let probe = PendingProbe::new(1_000, 100, 50, 50);
        assert_eq!(probe.estimated_base_ms(1_030), 0);
        // Arrival before send (clock skew between marks) clamps to zero too
        assert_eq!(probe.measured_rtt_ms(900), 0);
    }

    #[test]
    fn test_send_mark_takes_precedence_over_creation() {
        let mut probe = PendingProbe::new(1_000, 0, 0, 0);
        probe.actual_send_ms = Some(1_010);
        assert_eq!(probe.measured_rtt_ms(1_070), 60);
    }

    #[test]
    fn test_reported_arrival_wins_over_arrival_mark() {
        let mut probe = PendingProbe::new(1_000, 40, 20, 20);
        probe.actual_send_ms = Some(1_000);
        probe.arrival_ms = Some(1_100);
        assert_eq!(probe.measured_rtt_ms(1_120), 120);
        assert_eq!(probe.estimated_base_ms(1_120), 80);
    }

    #[test]
    fn test_take_removes_exactly_once() {
        let table = ProbeCorrelator::new();
        let id = ProbeId::new(42);
        table.insert(id, PendingProbe::new(0, 10, 5, 5));

        assert!(table.mark_sent(id, 1));
        assert!(table.mark_arrived(id, 30));
        let probe = table.take(id).expect("probe registered");
        assert_eq!(probe.actual_send_ms, Some(1));
        assert_eq!(probe.arrival_ms, Some(30));

        assert!(table.take(id).is_none());
        assert!(!table.mark_sent(id, 2));
        assert!(!table.mark_arrived(id, 3));
    }

    #[test]
    fn test_prune_removes_only_old_probes() {
        let table = ProbeCorrelator::new();
        table.insert(ProbeId::new(1), PendingProbe::new(0, 0, 0, 0));
        table.insert(ProbeId::new(2), PendingProbe::new(9_000, 0, 0, 0));

        assert_eq!(table.prune_older_than(10_500, 10_000), 1);
        assert!(!table.contains(ProbeId::new(1)));
        assert!(table.contains(ProbeId::new(2)));
    }

    #[test]
    fn test_concurrent_marks_from_multiple_threads() {
        let table = Arc::new(ProbeCorrelator::new());
        for i in 0..64 {
            table.insert(ProbeId::new(i), PendingProbe::new(i, 0, 0, 0));
        }

        let senders = {
            let table = table.clone();
            std::thread::spawn(move || {
                for i in 0..64 {
                    assert!(table.mark_sent(ProbeId::new(i), i + 1));
                }
            })
        };
        let arrivals = {
            let table = table.clone();
            std::thread::spawn(move || {
                for i in 0..64 {
                    assert!(table.mark_arrived(ProbeId::new(i), i + 100));
                }
            })
        };
        senders.join().unwrap();
        arrivals.join().unwrap();

        for i in 0..64 {
            let probe = table.take(ProbeId::new(i)).unwrap();
            assert_eq!(probe.actual_send_ms, Some(i + 1));
            assert_eq!(probe.arrival_ms, Some(i + 100));
        }
        assert!(table.is_empty());
    }
}
