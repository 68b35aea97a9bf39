//! Delay engine statistics and the human readable status line.

use std::fmt::Write;

use super::mode::DelayMode;

/// Snapshot of the delay controller state.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayStats {
    pub mode: DelayMode,
    /// Combined injected delay (before splitting).
    pub delay_ms: u64,
    pub outbound_delay_ms: u64,
    pub inbound_delay_ms: u64,
    /// Most recent base-RTT estimate.
    pub last_base_ms: Option<u64>,
    /// Exponentially smoothed base-RTT estimate.
    pub smoothed_base_ms: Option<u64>,
    /// Age of the last base sample at snapshot time.
    pub base_sample_age_ms: Option<u64>,
    /// Whether the last base sample is inside the freshness window.
    pub base_fresh: bool,
    /// A probe has been requested and its result not processed yet.
    pub awaiting_base: bool,
    /// Current smoothed match-mode target.
    pub match_target_ms: Option<u64>,
    pub pending_probes: usize,
    pub samples_taken: u64,
    /// Probe results dropped because their id was unknown or already used.
    pub stale_results: u64,
    /// Pending probes dropped because no reply came back in time.
    pub probes_pruned: u64,
}

impl DelayStats {
    /// Round-trip time actually added: the sum of both direction portions.
    pub fn added_ms(&self) -> u64 {
        self.outbound_delay_ms + self.inbound_delay_ms
    }

    /// One-line status: the mode, plus base/added/total when a fresh base
    /// sample exists, or `measuring` while an RTT-driven mode waits for one.
    pub fn summary(&self) -> String {
        let mut out = format!("mode={}", self.mode);
        match (&self.mode, self.base_fresh, self.last_base_ms) {
            (DelayMode::Off, _, _) => {}
            (_, true, Some(base)) => {
                let _ = write!(
                    out,
                    " base={base}ms added={}ms total={}ms",
                    self.added_ms(),
                    base + self.added_ms()
                );
            }
            (DelayMode::Add { .. }, _, _) => {
                let _ = write!(out, " added={}ms", self.added_ms());
            }
            _ => {
                let _ = write!(out, " measuring added={}ms", self.added_ms());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(mode: DelayMode) -> DelayStats {
        DelayStats {
            mode,
            delay_ms: 0,
            outbound_delay_ms: 0,
            inbound_delay_ms: 0,
            last_base_ms: None,
            smoothed_base_ms: None,
            base_sample_age_ms: None,
            base_fresh: false,
            awaiting_base: false,
            match_target_ms: None,
            pending_probes: 0,
            samples_taken: 0,
            stale_results: 0,
            probes_pruned: 0,
        }
    }

    #[test]
    fn test_summary_off() {
        assert_eq!(stats(DelayMode::Off).summary(), "mode=off");
    }

    #[test]
    fn test_summary_measuring() {
        let mut s = stats(DelayMode::Total { target_ms: 100 });
        s.awaiting_base = true;
        assert_eq!(s.summary(), "mode=total(100ms) measuring added=0ms");
    }

    #[test]
    fn test_summary_with_fresh_base() {
        let mut s = stats(DelayMode::Total { target_ms: 100 });
        s.delay_ms = 40;
        s.outbound_delay_ms = 20;
        s.inbound_delay_ms = 20;
        s.last_base_ms = Some(60);
        s.base_fresh = true;
        assert_eq!(
            s.summary(),
            "mode=total(100ms) base=60ms added=40ms total=100ms"
        );
    }

    #[test]
    fn test_summary_add_reports_truncated_split() {
        let mut s = stats(DelayMode::Add { amount_ms: 51 });
        s.delay_ms = 51;
        s.outbound_delay_ms = 25;
        s.inbound_delay_ms = 25;
        assert_eq!(s.summary(), "mode=add(51ms) added=50ms");
    }
}
