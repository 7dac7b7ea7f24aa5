//! I/O multiplexing backends.
//!
//! Every [`EventLoop`](crate::EventLoop) owns exactly one [`Poller`], picked
//! once at construction from [`PollerKind`]. Both backends speak the same
//! contract and report readiness using the `POLL*` bits from
//! [`channel`](crate::channel).

mod epoll;
mod poll;

use std::{fmt, str::FromStr, sync::Arc};

pub use epoll::EpollPoller;
pub use poll::PollPoller;

use crate::{channel::Channel, error::Error, timestamp::Timestamp};

/// Environment variable forcing the `poll(2)` backend when set.
pub const USE_POLL_ENV: &str = "MILL_USE_POLL";

pub trait Poller: Send {
    /// Waits up to `timeout_ms` and appends ready channels to `active`.
    ///
    /// Returns the time the wait returned.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp;

    /// Reconciles the backend registration with `channel`'s interest.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Forgets `channel`. Its interest must already be cleared.
    fn remove_channel(&mut self, channel: &Arc<Channel>);

    fn has_channel(&self, channel: &Channel) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollerKind {
    #[default]
    Epoll,
    Poll,
}

impl PollerKind {
    pub fn from_env() -> Self {
        if std::env::var_os(USE_POLL_ENV).is_some() {
            PollerKind::Poll
        } else {
            PollerKind::Epoll
        }
    }

    pub fn build(self) -> std::io::Result<Box<dyn Poller>> {
        Ok(match self {
            PollerKind::Epoll => Box::new(EpollPoller::new()?),
            PollerKind::Poll => Box::new(PollPoller::new()),
        })
    }
}

impl FromStr for PollerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "epoll" => Ok(PollerKind::Epoll),
            "poll" => Ok(PollerKind::Poll),
            _ => Err(Error::UnknownPoller(s.to_string())),
        }
    }
}

impl fmt::Display for PollerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollerKind::Epoll => write!(f, "epoll"),
            PollerKind::Poll => write!(f, "poll"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_names() {
        assert_eq!("epoll".parse::<PollerKind>().unwrap(), PollerKind::Epoll);
        assert_eq!("POLL".parse::<PollerKind>().unwrap(), PollerKind::Poll);
        assert!("select".parse::<PollerKind>().is_err());
        assert_eq!(PollerKind::Poll.to_string(), "poll");
    }
}
