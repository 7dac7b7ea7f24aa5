use std::{collections::HashMap, io, os::fd::RawFd, sync::Arc};

use tracing::{error, trace};

use super::Poller;
use crate::{channel::Channel, timestamp::Timestamp};

/// Poller backed by `poll(2)`.
///
/// `pollfds` and `channels` mirror each other; a channel's index is its slot
/// in `pollfds`. Slots of channels without interest keep their place with the
/// descriptor stored as `-fd - 1`, which `poll(2)` ignores.
pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl Default for PollPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl PollPoller {
    pub fn new() -> Self {
        Self {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        // SAFETY: the pointer and length describe the live `pollfds` vector.
        let num_events = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();
        if num_events > 0 {
            trace!("{} events happened", num_events);
            let mut remaining = num_events;
            for pfd in &self.pollfds {
                if remaining == 0 {
                    break;
                }
                if pfd.revents > 0 {
                    remaining -= 1;
                    if let Some(channel) = self.channels.get(&pfd.fd) {
                        debug_assert_eq!(channel.fd(), pfd.fd);
                        channel.set_revents(pfd.revents as u32);
                        active.push(channel.clone());
                    }
                }
            }
        } else if num_events == 0 {
            trace!("nothing happened");
        } else if saved.kind() != io::ErrorKind::Interrupted {
            error!("PollPoller::poll() failed: {}", saved);
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("fd = {} events = {}", fd, channel.events());
        if channel.index() < 0 {
            assert!(!self.channels.contains_key(&fd), "fd {} already registered", fd);
            self.pollfds.push(libc::pollfd {
                fd: if channel.is_none_event() { -fd - 1 } else { fd },
                events: channel.events() as libc::c_short,
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as isize - 1);
            self.channels.insert(fd, channel.clone());
        } else {
            assert!(self.channels.contains_key(&fd));
            let idx = channel.index() as usize;
            assert!(idx < self.pollfds.len());
            let pfd = &mut self.pollfds[idx];
            assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.fd = fd;
            pfd.events = channel.events() as libc::c_short;
            pfd.revents = 0;
            if channel.is_none_event() {
                pfd.fd = -fd - 1;
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("fd = {}", fd);
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());
        let idx = channel.index() as usize;
        assert!(idx < self.pollfds.len());
        debug_assert!(self.pollfds[idx].fd == -fd - 1);
        self.channels.remove(&fd);
        if idx == self.pollfds.len() - 1 {
            self.pollfds.pop();
        } else {
            self.pollfds.swap_remove(idx);
            let mut moved_fd = self.pollfds[idx].fd;
            if moved_fd < 0 {
                moved_fd = -moved_fd - 1;
            }
            if let Some(moved) = self.channels.get(&moved_fd) {
                moved.set_index(idx as isize);
            }
        }
        channel.set_index(crate::channel::INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), channel))
    }
}
