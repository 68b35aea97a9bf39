//! Rate-limited smoothing of the match-mode target.
//!
//! The matched peer's reported latency is noisy and can spike. Feeding it
//! straight into the control target would make the injected delay jump, so the
//! target follows the raw value at a bounded slew rate, ignores jitter below a
//! noise floor, and only snaps directly to the raw value when it is close or
//! when the smoother has been idle long enough that its state is meaningless.

use crate::config::DelayConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SmootherParams {
    pub reset_window_ms: u64,
    pub noise_floor_ms: f64,
    pub rate_per_sec: f64,
    pub min_step_ms: f64,
    pub max_step_ms: f64,
}

impl From<&DelayConfig> for SmootherParams {
    fn from(config: &DelayConfig) -> Self {
        Self {
            reset_window_ms: config.match_reset_window.as_millis() as u64,
            noise_floor_ms: config.match_noise_floor_ms as f64,
            rate_per_sec: config.match_rate_per_sec,
            min_step_ms: config.match_min_step_ms,
            max_step_ms: config.match_max_step_ms,
        }
    }
}

/// Smoothed control target for match mode.
#[derive(Debug, Clone)]
pub(crate) struct MatchSmoother {
    smoothed: Option<f64>,
    last_update_ms: u64,
    params: SmootherParams,
}

impl MatchSmoother {
    pub fn new(params: SmootherParams) -> Self {
        Self {
            smoothed: None,
            last_update_ms: 0,
            params,
        }
    }

    /// Feeds the raw reported latency and returns the rounded control target.
    pub fn update(&mut self, raw_ms: u64, now_ms: u64) -> u64 {
        let raw = raw_ms as f64;
        let elapsed_ms = now_ms.saturating_sub(self.last_update_ms);

        let smoothed = match self.smoothed {
            Some(smoothed) if elapsed_ms < self.params.reset_window_ms => smoothed,
            _ => {
                self.smoothed = Some(raw);
                self.last_update_ms = now_ms;
                return raw_ms;
            }
        };
        self.last_update_ms = now_ms;

        let delta = raw - smoothed;
        if delta.abs() <= self.params.noise_floor_ms {
            return round_target(smoothed);
        }

        let elapsed_secs = elapsed_ms as f64 / 1000.0;
        let allowed_step = (elapsed_secs * self.params.rate_per_sec)
            .clamp(self.params.min_step_ms, self.params.max_step_ms);
        let next = if delta.abs() <= allowed_step {
            raw
        } else {
            smoothed + delta.signum() * allowed_step
        };
        self.smoothed = Some(next);
        round_target(next)
    }

    /// Current smoothed target, if any.
    pub fn current(&self) -> Option<u64> {
        self.smoothed.map(round_target)
    }

    pub fn reset(&mut self) {
        self.smoothed = None;
        self.last_update_ms = 0;
    }
}

fn round_target(value: f64) -> u64 {
    value.round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smoother() -> MatchSmoother {
        MatchSmoother::new(SmootherParams::from(&DelayConfig::default()))
    }

    #[test]
    fn test_first_value_snaps_to_raw() {
        let mut s = smoother();
        assert_eq!(s.current(), None);
        assert_eq!(s.update(140, 10_000), 140);
        assert_eq!(s.current(), Some(140));
    }

    #[test]
    fn test_large_jump_is_rate_limited() {
        let mut s = smoother();
        s.update(50, 0);
        // 1s elapsed at 25ms/s allows a 25ms step towards 200
        assert_eq!(s.update(200, 1_000), 75);
        // Another second, another 25ms
        assert_eq!(s.update(200, 2_000), 100);
    }

    #[test]
    fn test_jitter_below_noise_floor_is_ignored() {
        let mut s = smoother();
        s.update(100, 0);
        assert_eq!(s.update(103, 500), 100);
        assert_eq!(s.update(97, 1_000), 100);
    }

    #[test]
    fn test_small_delta_within_step_snaps() {
        let mut s = smoother();
        s.update(100, 0);
        // 10ms delta, 1s elapsed → 25ms allowed step
        assert_eq!(s.update(110, 1_000), 110);
    }

    #[test]
    fn test_step_clamped_to_minimum() {
        let mut s = smoother();
        s.update(100, 0);
        // 20ms elapsed allows 0.5ms, clamped to the 1ms minimum
        assert_eq!(s.update(150, 20), 101);
    }

    #[test]
    fn test_step_clamped_to_maximum() {
        let mut s = smoother();
        s.update(0, 0);
        // 4s elapsed would allow 100ms, capped at 75ms
        assert_eq!(s.update(500, 4_000), 75);
    }

    #[test]
    fn test_downward_moves_are_limited_too() {
        let mut s = smoother();
        s.update(300, 0);
        assert_eq!(s.update(100, 1_000), 275);
    }

    #[test]
    fn test_idle_gap_reacquires_raw() {
        let mut s = smoother();
        s.update(50, 0);
        assert_eq!(s.update(400, 5_000), 400);
    }

    #[test]
    fn test_reset_forgets_state() {
        let mut s = smoother();
        s.update(50, 0);
        s.reset();
        assert_eq!(s.current(), None);
        assert_eq!(s.update(300, 100), 300);
    }
}
