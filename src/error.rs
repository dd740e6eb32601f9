use thiserror::Error;

/// Why a captured frame could not be turned into a [`crate::core::Packet`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedReason {
    #[error("truncated header: {0}")]
    Truncated(String),

    #[error("unsupported layer: {0}")]
    Unsupported(&'static str),

    #[error("empty frame")]
    Empty,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] MalformedReason),

    #[error("flow table is full and no flow could be evicted (shard {shard})")]
    EvictionFailed { shard: usize },

    #[error("flow table invariant violated: {0}")]
    Invariant(String),

    #[error("emitter buffer full, record dropped")]
    EmitterFull,

    #[error("emitter buffer still full after {0} ms, record dropped")]
    EmitTimeout(u64),

    #[error("emitter is closed")]
    EmitterClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Errors that indicate a broken concurrency contract rather than bad input
    pub fn is_fatal(&self) -> bool {
        matches!(self, FlowError::Invariant(_))
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
