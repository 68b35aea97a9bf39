use dashmap::DashMap;

/// Lookup of the latency other peers report, used by match mode.
pub trait PeerLatency: Send + Sync {
    /// Latest reported latency of `peer_id` in milliseconds, or `None` when
    /// the peer is unknown or has not reported yet.
    fn latency_ms(&self, peer_id: &str) -> Option<u64>;
}

impl<F> PeerLatency for F
where
    F: Fn(&str) -> Option<u64> + Send + Sync,
{
    fn latency_ms(&self, peer_id: &str) -> Option<u64> {
        self(peer_id)
    }
}

/// Latency table fed by whatever component receives peer reports.
#[derive(Debug, Default)]
pub struct PeerLatencyTable {
    reported: DashMap<String, u64>,
}

impl PeerLatencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, peer_id: impl Into<String>, latency_ms: u64) {
        self.reported.insert(peer_id.into(), latency_ms);
    }

    pub fn forget(&self, peer_id: &str) {
        self.reported.remove(peer_id);
    }
}

impl PeerLatency for PeerLatencyTable {
    fn latency_ms(&self, peer_id: &str) -> Option<u64> {
        self.reported.get(peer_id).map(|entry| *entry)
    }
}

/// Peer lookup that never has data; match mode then adds no delay.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeers;

impl PeerLatency for NoPeers {
    fn latency_ms(&self, _peer_id: &str) -> Option<u64> {
        None
    }
}
