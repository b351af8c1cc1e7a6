use std::time::Duration;

use dmsgprims_frame::pool::DEFAULT_POOL_CAPACITY;
use dmsgprims_frame::FrameConfig;

/// Default heartbeat timeout of the core loop's poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection behavior settings.
#[derive(Debug, Clone)]
pub struct IocomConfig {
    /// Framing limits and originated byte order.
    pub frame: FrameConfig,
    /// How long the core loop blocks in `poll(2)` with no work pending.
    pub poll_timeout: Duration,
    /// Containers kept per message free list.
    pub pool_capacity: usize,
    /// Name used in log records.
    pub label: String,
}

impl IocomConfig {
    pub fn with_frame(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl Default for IocomConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            label: "iocom".to_string(),
        }
    }
}
