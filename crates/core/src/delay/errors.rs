use thiserror::Error;

#[derive(Debug, Error)]
pub enum DelayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed serializing configuration: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("delay engine closed")]
    EngineClosed,
}

/// Returned by a [`PacketSink`](super::PacketSink) that can no longer accept
/// packets.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("{direction} consumer closed")]
    Closed { direction: super::Direction },

    #[error("transport error: {0}")]
    Transport(String),
}
