use std::{
    collections::HashMap,
    io,
    os::fd::RawFd,
    sync::Arc,
    time::Duration,
};

use mio::{event::Event, unix::SourceFd, Events, Interest, Poll, Token};
use tracing::{error, trace};

use super::Poller;
use crate::{
    channel::{
        Channel, INDEX_NEW, POLLERR, POLLHUP, POLLIN, POLLOUT, POLLPRI, POLLRDHUP, READ_EVENT,
        WRITE_EVENT,
    },
    timestamp::Timestamp,
};

const INIT_EVENT_LIST_SIZE: usize = 16;

const INDEX_ADDED: isize = 1;
const INDEX_DELETED: isize = 2;

/// Poller backed by [`mio::Poll`], which is epoll on Linux.
///
/// The descriptor doubles as the [`Token`], so readiness maps straight back
/// to the registered channel. mio registers edge-triggered; consumers drain
/// their descriptors until `WouldBlock`.
pub struct EpollPoller {
    poll: Poll,
    events: Events,
    capacity: usize,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(INIT_EVENT_LIST_SIZE),
            capacity: INIT_EVENT_LIST_SIZE,
            channels: HashMap::new(),
        })
    }

    fn interest_of(channel: &Channel) -> Option<Interest> {
        let events = channel.events();
        match (events & READ_EVENT != 0, events & WRITE_EVENT != 0) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn register(&self, channel: &Channel, interest: Interest) {
        let fd = channel.fd();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), interest)
        {
            error!("EpollPoller register fd = {} failed: {}", fd, e);
        }
    }

    fn reregister(&self, channel: &Channel, interest: Interest) {
        let fd = channel.fd();
        if let Err(e) = self
            .poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
        {
            error!("EpollPoller reregister fd = {} failed: {}", fd, e);
        }
    }

    fn deregister(&self, channel: &Channel) {
        let fd = channel.fd();
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            error!("EpollPoller deregister fd = {} failed: {}", fd, e);
        }
    }
}

/// Translates mio readiness back into `POLL*` bits.
fn revents_of(event: &Event) -> u32 {
    let mut revents = 0;
    if event.is_readable() {
        revents |= POLLIN;
    }
    if event.is_priority() {
        revents |= POLLPRI;
    }
    if event.is_writable() {
        revents |= POLLOUT;
    }
    if event.is_error() {
        revents |= POLLERR;
    }
    match (event.is_read_closed(), event.is_write_closed()) {
        (true, true) => revents |= POLLHUP,
        (true, false) => revents |= POLLRDHUP,
        _ => {}
    }
    revents
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        let timeout = Duration::from_millis(timeout_ms.max(0) as u64);
        let result = self.poll.poll(&mut self.events, Some(timeout));
        let now = Timestamp::now();
        match result {
            Ok(()) => {
                let mut num_events = 0;
                for event in self.events.iter() {
                    num_events += 1;
                    let fd = event.token().0 as RawFd;
                    if let Some(channel) = self.channels.get(&fd) {
                        channel.set_revents(revents_of(event));
                        active.push(channel.clone());
                    }
                }
                if num_events == 0 {
                    trace!("nothing happened");
                } else {
                    trace!("{} events happened", num_events);
                }
                if num_events == self.capacity {
                    self.capacity *= 2;
                    self.events = Events::with_capacity(self.capacity);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!("EpollPoller::poll() failed: {}", e),
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let index = channel.index();
        trace!("fd = {} events = {} index = {}", fd, channel.events(), index);
        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                assert!(!self.channels.contains_key(&fd), "fd {} already registered", fd);
                self.channels.insert(fd, channel.clone());
            } else {
                assert!(self.channels.contains_key(&fd));
            }
            match Self::interest_of(channel) {
                Some(interest) => {
                    channel.set_index(INDEX_ADDED);
                    self.register(channel, interest);
                }
                None => channel.set_index(INDEX_DELETED),
            }
        } else {
            assert!(self.channels.contains_key(&fd));
            assert_eq!(index, INDEX_ADDED);
            match Self::interest_of(channel) {
                Some(interest) => self.reregister(channel, interest),
                None => {
                    self.deregister(channel);
                    channel.set_index(INDEX_DELETED);
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("fd = {}", fd);
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());
        let index = channel.index();
        assert!(index == INDEX_ADDED || index == INDEX_DELETED);
        self.channels.remove(&fd);
        if index == INDEX_ADDED {
            self.deregister(channel);
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), channel))
    }
}
