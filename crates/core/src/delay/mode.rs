use std::fmt;

/// Active delay control mode.
///
/// Exactly one mode is active per engine. Transitions only happen on explicit
/// command, or when the connection lifecycle forces [`DelayMode::Off`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum DelayMode {
    /// No artificial delay.
    #[default]
    Off,
    /// Fixed additive round-trip delay, independent of the measured path.
    Add { amount_ms: u64 },
    /// Steer the observed round-trip time to a fixed total.
    ///
    /// A target of zero is a no-op: no delay is added.
    Total { target_ms: u64 },
    /// Steer the observed round-trip time to another peer's reported latency.
    Match { peer_id: String },
}

impl DelayMode {
    /// Whether the mode needs a base-RTT estimate before it can set a delay.
    pub fn needs_base(&self) -> bool {
        matches!(self, DelayMode::Total { .. } | DelayMode::Match { .. })
    }

    pub fn is_off(&self) -> bool {
        matches!(self, DelayMode::Off)
    }
}

impl fmt::Display for DelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayMode::Off => write!(f, "off"),
            DelayMode::Add { amount_ms } => write!(f, "add({amount_ms}ms)"),
            DelayMode::Total { target_ms } => write!(f, "total({target_ms}ms)"),
            DelayMode::Match { peer_id } => write!(f, "match({peer_id})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_display() {
        assert_eq!(DelayMode::Off.to_string(), "off");
        assert_eq!(DelayMode::Add { amount_ms: 50 }.to_string(), "add(50ms)");
        assert_eq!(
            DelayMode::Total { target_ms: 120 }.to_string(),
            "total(120ms)"
        );
        assert_eq!(
            DelayMode::Match {
                peer_id: "alice".into()
            }
            .to_string(),
            "match(alice)"
        );
    }

    #[test]
    fn test_only_rtt_driven_modes_need_base() {
        assert!(!DelayMode::Off.needs_base());
        assert!(!DelayMode::Add { amount_ms: 10 }.needs_base());
        assert!(DelayMode::Total { target_ms: 10 }.needs_base());
        assert!(DelayMode::Match {
            peer_id: "bob".into()
        }
        .needs_base());
    }
}
