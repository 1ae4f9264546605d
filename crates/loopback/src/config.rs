use common::{Profile, get_env};

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    pub profile: Profile,
    /// Ring capacity in bytes.
    pub ring_bytes: usize,
    /// How many messages to stream.
    pub message_count: u64,
    /// Base message size; every eighth message is inflated past the ring
    /// capacity to exercise splitting.
    pub message_bytes: usize,
}

impl LoopbackConfig {
    /// Load configuration from environment variables with sensible defaults
    pub fn from_env() -> Self {
        Self {
            profile: Profile::from_env(),
            ring_bytes: get_env("LOOPBACK_RING_BYTES", 64 * 1024),
            message_count: get_env("LOOPBACK_MESSAGE_COUNT", 10_000),
            message_bytes: get_env("LOOPBACK_MESSAGE_BYTES", 512),
        }
    }
}
