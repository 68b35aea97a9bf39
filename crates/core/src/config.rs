//! Delay engine configuration.
//!
//! All tunables of the delay engine live in [`DelayConfig`]. A config can be
//! built from defaults, loaded from a TOML file, or assembled from command line
//! arguments (and their environment variable fallbacks) via [`ConfigArgs`].

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::delay::DelayError;

/// Maximum age of a base-RTT sample still usable by `Total`/`Match` control.
pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_millis(250);
/// Minimum spacing between two probe requests.
pub const DEFAULT_PROBE_COOLDOWN: Duration = Duration::from_millis(400);
/// Pending probes older than this are assumed lost and pruned.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Weight of a fresh base sample in the exponentially smoothed base.
pub const DEFAULT_BASE_SMOOTHING: f64 = 0.15;
/// Final stretch of a release wait that is busy-waited instead of slept.
pub const DEFAULT_PRECISION_WINDOW: Duration = Duration::from_millis(2);
/// Floor for the drain loop's re-arm timer.
pub const DEFAULT_MIN_RESCHEDULE: Duration = Duration::from_millis(1);
/// Cadence of the host tick driving `recompute` (20 ticks per second).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);
/// Idle gap after which the match smoother re-acquires the raw target.
pub const DEFAULT_MATCH_RESET_WINDOW: Duration = Duration::from_millis(5000);
pub const DEFAULT_MATCH_NOISE_FLOOR_MS: u64 = 3;
pub const DEFAULT_MATCH_RATE_PER_SEC: f64 = 25.0;
pub const DEFAULT_MATCH_MIN_STEP_MS: f64 = 1.0;
pub const DEFAULT_MATCH_MAX_STEP_MS: f64 = 75.0;

/// How the combined injected delay is divided between the two directions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum DelaySplit {
    /// Each direction receives `floor(delay / 2)`; an odd remainder is dropped.
    #[default]
    Truncate,
    /// Outbound receives `ceil(delay / 2)`, inbound `floor(delay / 2)`, so the
    /// two portions always add up to the configured delay.
    RemainderOutbound,
}

impl DelaySplit {
    /// Returns the `(outbound, inbound)` portions of a combined delay.
    pub fn split(self, delay_ms: u64) -> (u64, u64) {
        let half = delay_ms / 2;
        match self {
            DelaySplit::Truncate => (half, half),
            DelaySplit::RemainderOutbound => (delay_ms - half, half),
        }
    }
}

/// Tunables of the delay engine.
///
/// Every field has a default; a TOML file only needs to mention the fields it
/// overrides. Durations are written as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    #[serde(with = "serde_millis")]
    pub freshness_window: Duration,
    #[serde(with = "serde_millis")]
    pub probe_cooldown: Duration,
    #[serde(with = "serde_millis")]
    pub probe_timeout: Duration,
    /// Weight of a new sample in the smoothed base, in `[0, 1]`.
    pub base_smoothing: f64,
    #[serde(with = "serde_millis")]
    pub precision_window: Duration,
    #[serde(with = "serde_millis")]
    pub min_reschedule: Duration,
    #[serde(with = "serde_millis")]
    pub tick_interval: Duration,
    #[serde(with = "serde_millis")]
    pub match_reset_window: Duration,
    pub match_noise_floor_ms: u64,
    pub match_rate_per_sec: f64,
    pub match_min_step_ms: f64,
    pub match_max_step_ms: f64,
    pub split: DelaySplit,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            freshness_window: DEFAULT_FRESHNESS_WINDOW,
            probe_cooldown: DEFAULT_PROBE_COOLDOWN,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            base_smoothing: DEFAULT_BASE_SMOOTHING,
            precision_window: DEFAULT_PRECISION_WINDOW,
            min_reschedule: DEFAULT_MIN_RESCHEDULE,
            tick_interval: DEFAULT_TICK_INTERVAL,
            match_reset_window: DEFAULT_MATCH_RESET_WINDOW,
            match_noise_floor_ms: DEFAULT_MATCH_NOISE_FLOOR_MS,
            match_rate_per_sec: DEFAULT_MATCH_RATE_PER_SEC,
            match_min_step_ms: DEFAULT_MATCH_MIN_STEP_MS,
            match_max_step_ms: DEFAULT_MATCH_MAX_STEP_MS,
            split: DelaySplit::Truncate,
        }
    }
}

impl DelayConfig {
    /// Reads a config from a TOML file. Missing fields take their defaults.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, DelayError> {
        let path = path.as_ref();
        tracing::debug!(path = ?path, "Reading delay configuration file");
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, DelayError> {
        let config = toml::from_str::<DelayConfig>(content)?;
        Ok(config.sanitized())
    }

    pub fn to_toml_string(&self) -> Result<String, DelayError> {
        Ok(toml::to_string(self)?)
    }

    /// Clamps out-of-range values into their valid range instead of
    /// rejecting the config.
    pub fn sanitized(mut self) -> Self {
        if !self.base_smoothing.is_finite() {
            self.base_smoothing = DEFAULT_BASE_SMOOTHING;
        }
        self.base_smoothing = self.base_smoothing.clamp(0.0, 1.0);
        if !self.match_rate_per_sec.is_finite() || self.match_rate_per_sec < 0.0 {
            self.match_rate_per_sec = 0.0;
        }
        if !self.match_min_step_ms.is_finite() || self.match_min_step_ms < 0.0 {
            self.match_min_step_ms = 0.0;
        }
        if !self.match_max_step_ms.is_finite() || self.match_max_step_ms < self.match_min_step_ms {
            self.match_max_step_ms = self.match_min_step_ms;
        }
        if self.tick_interval.is_zero() {
            self.tick_interval = DEFAULT_TICK_INTERVAL;
        }
        self
    }
}

/// Command line overrides for [`DelayConfig`].
///
/// Values given on the command line (or through their environment variables)
/// take precedence over the ones read from `--config`.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// TOML file with delay engine settings.
    #[arg(long = "config", env = "RTT_EQ_CONFIG")]
    pub config_path: Option<PathBuf>,

    /// Maximum age (ms) of a base-RTT sample used for control decisions.
    #[arg(long, env = "RTT_EQ_FRESHNESS_MS")]
    pub freshness_ms: Option<u64>,

    /// Minimum spacing (ms) between probe requests.
    #[arg(long, env = "RTT_EQ_PROBE_COOLDOWN_MS")]
    pub probe_cooldown_ms: Option<u64>,

    /// Busy-wait window (ms) at the end of each release wait.
    #[arg(long, env = "RTT_EQ_PRECISION_WINDOW_MS")]
    pub precision_window_ms: Option<u64>,

    /// Interval (ms) between control ticks.
    #[arg(long, env = "RTT_EQ_TICK_MS")]
    pub tick_ms: Option<u64>,

    /// How the injected delay is divided between directions.
    #[arg(long, value_enum, env = "RTT_EQ_SPLIT")]
    pub split: Option<DelaySplit>,
}

impl ConfigArgs {
    pub fn build(self) -> Result<DelayConfig, DelayError> {
        let mut config = match &self.config_path {
            Some(path) => DelayConfig::from_toml_file(path)?,
            None => DelayConfig::default(),
        };
        if let Some(ms) = self.freshness_ms {
            config.freshness_window = Duration::from_millis(ms);
        }
        if let Some(ms) = self.probe_cooldown_ms {
            config.probe_cooldown = Duration::from_millis(ms);
        }
        if let Some(ms) = self.precision_window_ms {
            config.precision_window = Duration::from_millis(ms);
        }
        if let Some(ms) = self.tick_ms {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(split) = self.split {
            config.split = split;
        }
        Ok(config.sanitized())
    }
}

mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = DelayConfig::default();
        assert_eq!(config.freshness_window, Duration::from_millis(250));
        assert_eq!(config.probe_cooldown, Duration::from_millis(400));
        assert_eq!(config.precision_window, Duration::from_millis(2));
        assert_eq!(config.match_reset_window, Duration::from_millis(5000));
        assert_eq!(config.match_noise_floor_ms, 3);
        assert_eq!(config.split, DelaySplit::Truncate);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DelayConfig::from_toml_str(
            r#"
            freshness_window = 500
            split = "remainder_outbound"
            "#,
        )
        .unwrap();
        assert_eq!(config.freshness_window, Duration::from_millis(500));
        assert_eq!(config.split, DelaySplit::RemainderOutbound);
        assert_eq!(config.probe_cooldown, DEFAULT_PROBE_COOLDOWN);
    }

    #[test]
    fn test_toml_serialization_roundtrip() {
        let config = DelayConfig {
            probe_timeout: Duration::from_secs(3),
            ..DelayConfig::default()
        };
        let serialized = config.to_toml_string().unwrap();
        let parsed = DelayConfig::from_toml_str(&serialized).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let err = DelayConfig::from_toml_str("freshness_window = \"soon\"").unwrap_err();
        assert!(matches!(err, DelayError::Toml(_)));
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let config = DelayConfig::from_toml_str(
            r#"
            base_smoothing = 4.0
            match_rate_per_sec = -3.0
            match_min_step_ms = 10.0
            match_max_step_ms = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(config.base_smoothing, 1.0);
        assert_eq!(config.match_rate_per_sec, 0.0);
        assert_eq!(config.match_max_step_ms, 10.0);
    }

    #[test]
    fn test_split_policies() {
        assert_eq!(DelaySplit::Truncate.split(50), (25, 25));
        assert_eq!(DelaySplit::Truncate.split(51), (25, 25));
        assert_eq!(DelaySplit::Truncate.split(1), (0, 0));
        assert_eq!(DelaySplit::RemainderOutbound.split(51), (26, 25));
        assert_eq!(DelaySplit::RemainderOutbound.split(1), (1, 0));
    }

    #[test]
    fn test_args_override_file() -> testresult::TestResult {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "freshness_window = 300\ntick_interval = 100")?;

        let args = ConfigArgs {
            config_path: Some(file.path().to_path_buf()),
            freshness_ms: Some(150),
            ..ConfigArgs::default()
        };
        let config = args.build()?;
        assert_eq!(config.freshness_window, Duration::from_millis(150));
        assert_eq!(config.tick_interval, Duration::from_millis(100));
        Ok(())
    }

    #[test]
    fn test_missing_config_file_is_io_error() {
        let args = ConfigArgs {
            config_path: Some(PathBuf::from("/nonexistent/rtt-equalizer.toml")),
            ..ConfigArgs::default()
        };
        assert!(matches!(args.build(), Err(DelayError::Io(_))));
    }
}
