//! Socket and monitor configuration
//!
//! `SocketOptions` mirrors the libzmq options that affect waiting
//! (`ZMQ_SNDTIMEO`, `ZMQ_RCVTIMEO`); `MonitorConfig` tunes the
//! background readiness thread.

use std::time::Duration;

/// Default bound on a single monitor poll.
///
/// New interest is signalled through the monitor's notifier, so this only
/// limits how long a missed edge on an edge-style descriptor can go unnoticed.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default name of the monitor thread.
pub const DEFAULT_THREAD_NAME: &str = "zgate-monitor";

/// Socket configuration options.
///
/// # Examples
///
/// ```
/// use zgate_core::options::SocketOptions;
/// use std::time::Duration;
///
/// let opts = SocketOptions::default()
///     .with_recv_timeout(Duration::from_secs(5))
///     .with_send_timeout(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Receive timeout (ZMQ_RCVTIMEO)
    ///
    /// Maximum time an async receive waits for readability.
    /// - `None`: Wait indefinitely (default)
    /// - `Some(Duration::ZERO)`: Non-blocking (fail with `WouldBlock`)
    /// - `Some(duration)`: Fail with `Timeout` after duration
    pub recv_timeout: Option<Duration>,

    /// Send timeout (ZMQ_SNDTIMEO)
    ///
    /// Same semantics as `recv_timeout`, for writability.
    pub send_timeout: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            recv_timeout: None, // Wait indefinitely
            send_timeout: None, // Wait indefinitely
        }
    }
}

impl SocketOptions {
    /// Create new socket options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set receive timeout.
    ///
    /// # Examples
    ///
    /// ```
    /// use zgate_core::options::SocketOptions;
    /// use std::time::Duration;
    ///
    /// // Non-blocking receive
    /// let opts = SocketOptions::new().with_recv_timeout(Duration::ZERO);
    ///
    /// // 5 second timeout
    /// let opts = SocketOptions::new().with_recv_timeout(Duration::from_secs(5));
    /// ```
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    /// Set send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Check if receive operation should be non-blocking.
    pub fn is_recv_nonblocking(&self) -> bool {
        matches!(self.recv_timeout, Some(d) if d.is_zero())
    }

    /// Check if send operation should be non-blocking.
    pub fn is_send_nonblocking(&self) -> bool {
        matches!(self.send_timeout, Some(d) if d.is_zero())
    }
}

/// Monitor thread configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Upper bound for one blocking poll. Must be non-zero.
    pub poll_interval: Duration,

    /// Name given to the monitor OS thread.
    pub thread_name: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll bound. Zero is raised to one millisecond.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = SocketOptions::default();
        assert!(opts.recv_timeout.is_none());
        assert!(opts.send_timeout.is_none());
    }

    #[test]
    fn test_builder_pattern() {
        let opts = SocketOptions::new()
            .with_recv_timeout(Duration::from_secs(5))
            .with_send_timeout(Duration::from_secs(10));

        assert_eq!(opts.recv_timeout, Some(Duration::from_secs(5)));
        assert_eq!(opts.send_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_nonblocking_checks() {
        let blocking = SocketOptions::new();
        assert!(!blocking.is_recv_nonblocking());
        assert!(!blocking.is_send_nonblocking());

        let nonblocking = SocketOptions::new()
            .with_recv_timeout(Duration::ZERO)
            .with_send_timeout(Duration::ZERO);
        assert!(nonblocking.is_recv_nonblocking());
        assert!(nonblocking.is_send_nonblocking());
    }

    #[test]
    fn test_monitor_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.thread_name, "zgate-monitor");

        let config = MonitorConfig::new()
            .with_poll_interval(Duration::ZERO)
            .with_thread_name("io-watch");
        assert_eq!(config.poll_interval, Duration::from_millis(1));
        assert_eq!(config.thread_name, "io-watch");
    }
}
