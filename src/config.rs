use std::{net::SocketAddr, time::Duration};

use crate::poller::PollerKind;

/// Default upper bound on a single poll wait.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Configuration for an [`EventLoop`](crate::EventLoop).
///
/// Use `EventLoopConfig::builder()` for ergonomic construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLoopConfig {
    /// Multiplexing backend
    pub poller: PollerKind,
    /// Longest time a single poll may block
    pub poll_timeout: Duration,
}

impl EventLoopConfig {
    pub fn builder() -> EventLoopConfigBuilder {
        EventLoopConfigBuilder::new()
    }
}

impl Default for EventLoopConfig {
    /// Backend from [`PollerKind::from_env`], 10 second poll timeout.
    fn default() -> Self {
        Self {
            poller: PollerKind::from_env(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
pub struct EventLoopConfigBuilder {
    poller: Option<PollerKind>,
    poll_timeout: Option<Duration>,
}

impl EventLoopConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poller(mut self, poller: PollerKind) -> Self {
        self.poller = Some(poller);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> EventLoopConfig {
        let default = EventLoopConfig::default();
        EventLoopConfig {
            poller: self.poller.unwrap_or(default.poller),
            poll_timeout: self.poll_timeout.unwrap_or(default.poll_timeout),
        }
    }
}

/// Configuration for a [`TcpServer`](crate::net::TcpServer).
///
/// ## Threading
///
/// - num_threads: 0 keeps every connection on the accepting loop; N spawns N
///   I/O loops that take connections round-robin
///
/// ## Socket Options
///
/// - reuse_port: sets SO_REUSEPORT on the listening socket
/// - no_delay: sets TCP_NODELAY on every accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpServerConfig {
    /// Address to listen on
    pub address: SocketAddr,
    /// Server name, prefix of every connection name
    pub name: String,
    /// Enable SO_REUSEPORT
    pub reuse_port: bool,
    /// Number of I/O threads
    pub num_threads: usize,
    /// Enable TCP_NODELAY on accepted connections
    pub no_delay: bool,
    /// Configuration of the I/O loops
    pub loop_config: EventLoopConfig,
}

impl TcpServerConfig {
    pub fn builder() -> TcpServerConfigBuilder {
        TcpServerConfigBuilder::new()
    }
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([0, 0, 0, 0], 9981)),
            name: "TcpServer".to_string(),
            reuse_port: false,
            num_threads: 0,
            no_delay: false,
            loop_config: EventLoopConfig::default(),
        }
    }
}

/// Builder for TcpServerConfig.
///
/// Unset fields fall back to `TcpServerConfig::default()`.
#[derive(Debug, Default)]
pub struct TcpServerConfigBuilder {
    address: Option<SocketAddr>,
    name: Option<String>,
    reuse_port: Option<bool>,
    num_threads: Option<usize>,
    no_delay: Option<bool>,
    loop_config: Option<EventLoopConfig>,
}

impl TcpServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn reuse_port(mut self, enabled: bool) -> Self {
        self.reuse_port = Some(enabled);
        self
    }

    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    pub fn loop_config(mut self, config: EventLoopConfig) -> Self {
        self.loop_config = Some(config);
        self
    }

    pub fn build(self) -> TcpServerConfig {
        let default = TcpServerConfig::default();
        TcpServerConfig {
            address: self.address.unwrap_or(default.address),
            name: self.name.unwrap_or(default.name),
            reuse_port: self.reuse_port.unwrap_or(default.reuse_port),
            num_threads: self.num_threads.unwrap_or(default.num_threads),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            loop_config: self.loop_config.unwrap_or(default.loop_config),
        }
    }
}
