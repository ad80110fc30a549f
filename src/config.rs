use crate::error::{Result, YamuxError};
use crate::frame::INITIAL_WINDOW_SIZE;
use std::time::Duration;

/// Configuration for a yamux session.
///
/// `Config` holds the tunable parameters of a session: the per-stream receive
/// window, keep-alive behaviour and the sizes of the session's internal
/// queues.
///
/// # Examples
///
/// ## Using default configuration
///
/// ```rust
/// use yamux::Config;
///
/// let config = Config::default();
/// assert_eq!(config.max_window_size, 256 * 1024);
/// assert!(config.enable_keep_alive);
/// ```
///
/// ## Creating custom configuration
///
/// ```rust
/// use yamux::ConfigBuilder;
/// use std::time::Duration;
///
/// let config = ConfigBuilder::new()
///     .max_window_size(1024 * 1024)
///     .keep_alive_interval(Duration::from_secs(15))
///     .build()
///     .expect("Valid configuration");
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Receive buffer capacity of every stream, and the base of the
    /// window-update threshold (half of it).
    pub max_window_size: u32,
    pub keep_alive_interval: Duration,
    pub keep_alive_timeout: Duration,
    pub enable_keep_alive: bool,
    /// Inbound streams that may wait for `accept_stream` before new ones are
    /// refused.
    pub accept_backlog: usize,
    pub event_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_window_size: INITIAL_WINDOW_SIZE, // 256KB
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(10),
            enable_keep_alive: true,
            accept_backlog: 256,
            event_buffer_size: 256,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_window_size == 0 {
            return Err(YamuxError::Config(
                "Max window size cannot be 0".to_string(),
            ));
        }

        if self.max_window_size > i32::MAX as u32 {
            return Err(YamuxError::Config(
                "Max window size must fit a signed 32-bit window delta".to_string(),
            ));
        }

        if self.keep_alive_enabled() && self.keep_alive_timeout.is_zero() {
            return Err(YamuxError::Config(
                "Keep-alive timeout cannot be 0 while keep-alive is enabled".to_string(),
            ));
        }

        if self.accept_backlog == 0 {
            return Err(YamuxError::Config("Accept backlog cannot be 0".to_string()));
        }

        if self.event_buffer_size == 0 {
            return Err(YamuxError::Config(
                "Event buffer size cannot be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Keep-alive pings run only when enabled with a non-zero interval.
    pub fn keep_alive_enabled(&self) -> bool {
        self.enable_keep_alive && !self.keep_alive_interval.is_zero()
    }

    /// Receive delta beyond which a window update is sent without waiting for
    /// new flags.
    pub fn window_update_threshold(&self) -> i64 {
        i64::from(self.max_window_size) / 2
    }
}

/// Builder for creating custom `Config` instances.
///
/// The builder normalises the window: sizes below the protocol's initial
/// window are raised to it.
///
/// ```rust
/// use yamux::ConfigBuilder;
///
/// let config = ConfigBuilder::new().max_window_size(4096).build().unwrap();
/// assert_eq!(config.max_window_size, 256 * 1024);
/// ```
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn max_window_size(mut self, size: u32) -> Self {
        self.config.max_window_size = size.max(INITIAL_WINDOW_SIZE);
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keep_alive_timeout = timeout;
        self
    }

    pub fn enable_keep_alive(mut self, enable: bool) -> Self {
        self.config.enable_keep_alive = enable;
        self
    }

    pub fn accept_backlog(mut self, backlog: usize) -> Self {
        self.config.accept_backlog = backlog;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
