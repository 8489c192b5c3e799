use std::time::Duration;

use crate::error::Error;

/// Configuration for the crypto pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of rings to drive. Must not exceed the packet engine's count.
    pub rings: usize,
    /// Queue length at or above which a new request is reported as
    /// backlogged. Backlogged requests are still queued.
    pub backlog_threshold: usize,
    /// Completion-notification policy.
    pub notify: NotifyConfig,
    /// Polled retrieval for precompute and invalidate commands.
    pub poll: PollConfig,
    /// Minimum SA buffer size in bytes. SA buffers are
    /// `max(4 * sa_words, min_sa_bytes)` bytes.
    pub min_sa_bytes: usize,
    /// Bytes a hash session caches before submitting work. Must be a
    /// multiple of the largest hash block size (128).
    pub hash_cache_size: usize,
    /// Capacity of the DTLS tunnel table.
    pub max_tunnels: usize,
    /// Spawn one dispatcher thread per ring. When disabled, the caller
    /// drives rings through `Engine::dispatch` and `Engine::drain`.
    pub spawn_workers: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rings: 4,
            backlog_threshold: 256,
            notify: NotifyConfig::default(),
            poll: PollConfig::default(),
            min_sa_bytes: 256,
            hash_cache_size: 128,
            max_tunnels: 32,
            spawn_workers: true,
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.rings == 0 || self.rings > 64 {
            return Err(Error::Config("rings must be in 1..=64".into()));
        }
        if self.backlog_threshold == 0 {
            return Err(Error::Config("backlog_threshold must be > 0".into()));
        }
        if self.notify.request_threshold == 0 {
            return Err(Error::Config(
                "notify.request_threshold must be > 0".into(),
            ));
        }
        if self.notify.delay.is_zero() {
            return Err(Error::Config("notify.delay must be > 0".into()));
        }
        if self.poll.retries == 0 {
            return Err(Error::Config("poll.retries must be > 0".into()));
        }
        if self.min_sa_bytes == 0 || self.min_sa_bytes % 4 != 0 {
            return Err(Error::Config(
                "min_sa_bytes must be a non-zero multiple of 4".into(),
            ));
        }
        if self.hash_cache_size == 0 || self.hash_cache_size % 128 != 0 {
            return Err(Error::Config(
                "hash_cache_size must be a non-zero multiple of 128".into(),
            ));
        }
        if self.max_tunnels == 0 || self.max_tunnels > u16::MAX as usize {
            return Err(Error::Config(
                "max_tunnels must be > 0 and <= 65535".into(),
            ));
        }
        Ok(())
    }
}

/// When to arm the one-shot completion notification of a ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyConfig {
    /// Arm immediately every time this many requests have been submitted.
    pub request_threshold: u64,
    /// Otherwise arm once this long after the first unannounced submission.
    pub delay: Duration,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            request_threshold: 16,
            delay: Duration::from_millis(2),
        }
    }
}

/// Bounded polling for synchronous commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollConfig {
    /// Attempts before giving up with `Error::Timeout`.
    pub retries: u32,
    /// Sleep between attempts.
    pub delay: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            retries: 1000,
            delay: Duration::from_micros(20),
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use cryptoline::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .rings(2)
///     .backlog_threshold(64)
///     .notify_threshold(8)
///     .notify_delay(Duration::from_millis(1))
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Ring settings ────────────────────────────────────────────────

    /// Set the number of rings.
    pub fn rings(mut self, n: usize) -> Self {
        self.config.rings = n;
        self
    }

    /// Set the queue length that marks new requests as backlogged.
    pub fn backlog_threshold(mut self, n: usize) -> Self {
        self.config.backlog_threshold = n;
        self
    }

    /// Spawn per-ring dispatcher threads, or drive rings manually.
    pub fn spawn_workers(mut self, enable: bool) -> Self {
        self.config.spawn_workers = enable;
        self
    }

    // ── Notification settings ────────────────────────────────────────

    /// Arm completion notification every `n` submissions.
    pub fn notify_threshold(mut self, n: u64) -> Self {
        self.config.notify.request_threshold = n;
        self
    }

    /// Arm completion notification at most this long after a submission.
    pub fn notify_delay(mut self, delay: Duration) -> Self {
        self.config.notify.delay = delay;
        self
    }

    // ── Polling settings ─────────────────────────────────────────────

    /// Set the attempt count and delay for polled retrieval.
    pub fn poll(mut self, retries: u32, delay: Duration) -> Self {
        self.config.poll.retries = retries;
        self.config.poll.delay = delay;
        self
    }

    // ── Resource settings ────────────────────────────────────────────

    /// Set the minimum SA buffer size in bytes.
    pub fn min_sa_bytes(mut self, n: usize) -> Self {
        self.config.min_sa_bytes = n;
        self
    }

    /// Set the hash session cache size in bytes.
    pub fn hash_cache_size(mut self, n: usize) -> Self {
        self.config.hash_cache_size = n;
        self
    }

    /// Set the DTLS tunnel table capacity.
    pub fn max_tunnels(mut self, n: usize) -> Self {
        self.config.max_tunnels = n;
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Terminal ─────────────────────────────────────────────────────

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
