//! Per-descriptor interest registration and event dispatch.

use std::{
    any::Any,
    fmt::Write as _,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, AtomicIsize, AtomicU32, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::{event_loop::EventLoop, timestamp::Timestamp};

// Readiness bits share poll(2)'s encoding regardless of backend.
pub const POLLIN: u32 = libc::POLLIN as u32;
pub const POLLPRI: u32 = libc::POLLPRI as u32;
pub const POLLOUT: u32 = libc::POLLOUT as u32;
pub const POLLERR: u32 = libc::POLLERR as u32;
pub const POLLHUP: u32 = libc::POLLHUP as u32;
pub const POLLNVAL: u32 = libc::POLLNVAL as u32;
pub const POLLRDHUP: u32 = libc::POLLRDHUP as u32;

pub const NONE_EVENT: u32 = 0;
pub const READ_EVENT: u32 = POLLIN | POLLPRI;
pub const WRITE_EVENT: u32 = POLLOUT;

/// Poller bookkeeping value of a channel that was never registered.
pub const INDEX_NEW: isize = -1;

pub type EventCallback = Arc<dyn Fn() + Send + Sync>;
pub type ReadEventCallback = Arc<dyn Fn(Timestamp) + Send + Sync>;

/// The registration unit of one file descriptor inside one [`EventLoop`].
///
/// A channel never owns its descriptor. Interest changes go through the
/// owning loop's poller, which keeps an `Arc<Channel>` for as long as the
/// descriptor is registered. All mutating methods must run on the loop
/// thread.
pub struct Channel {
    owner: Weak<EventLoop>,
    fd: RawFd,
    events: AtomicU32,
    revents: AtomicU32,
    index: AtomicIsize,
    log_hup: AtomicBool,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    event_handling: AtomicBool,
    added_to_loop: AtomicBool,
    read_callback: Mutex<Option<ReadEventCallback>>,
    write_callback: Mutex<Option<EventCallback>>,
    close_callback: Mutex<Option<EventCallback>>,
    error_callback: Mutex<Option<EventCallback>>,
}

impl Channel {
    pub fn new(event_loop: &Arc<EventLoop>, fd: RawFd) -> Arc<Self> {
        Self::with_owner(Arc::downgrade(event_loop), fd)
    }

    pub(crate) fn with_owner(owner: Weak<EventLoop>, fd: RawFd) -> Arc<Self> {
        Arc::new(Self {
            owner,
            fd,
            events: AtomicU32::new(NONE_EVENT),
            revents: AtomicU32::new(NONE_EVENT),
            index: AtomicIsize::new(INDEX_NEW),
            log_hup: AtomicBool::new(true),
            tie: Mutex::new(None),
            event_handling: AtomicBool::new(false),
            added_to_loop: AtomicBool::new(false),
            read_callback: Mutex::new(None),
            write_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> u32 {
        self.events.load(Ordering::Acquire)
    }

    pub fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Release);
    }

    pub fn revents(&self) -> u32 {
        self.revents.load(Ordering::Acquire)
    }

    pub fn index(&self) -> isize {
        self.index.load(Ordering::Acquire)
    }

    pub fn set_index(&self, index: isize) {
        self.index.store(index, Ordering::Release);
    }

    pub fn is_none_event(&self) -> bool {
        self.events() == NONE_EVENT
    }

    pub fn is_reading(&self) -> bool {
        self.events() & READ_EVENT != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events() & WRITE_EVENT != 0
    }

    pub fn set_log_hup(&self, on: bool) {
        self.log_hup.store(on, Ordering::Relaxed);
    }

    pub fn owner_loop(&self) -> Option<Arc<EventLoop>> {
        self.owner.upgrade()
    }

    pub(crate) fn is_owned_by(&self, event_loop: &EventLoop) -> bool {
        std::ptr::eq(self.owner.as_ptr(), event_loop)
    }

    pub fn set_read_callback<F>(&self, cb: F)
    where
        F: Fn(Timestamp) + Send + Sync + 'static,
    {
        *self.read_callback.lock() = Some(Arc::new(cb));
    }

    pub fn set_write_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.write_callback.lock() = Some(Arc::new(cb));
    }

    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.close_callback.lock() = Some(Arc::new(cb));
    }

    pub fn set_error_callback<F>(&self, cb: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.error_callback.lock() = Some(Arc::new(cb));
    }

    /// Ties dispatch to the lifetime of `owner`.
    ///
    /// Once tied, events are only delivered while `owner` can still be
    /// upgraded; afterwards they are dropped.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock() = Some(Arc::downgrade(owner));
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.events.fetch_or(READ_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.events.fetch_and(!READ_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.events.fetch_or(WRITE_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.events.fetch_and(!WRITE_EVENT, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.events.store(NONE_EVENT, Ordering::Release);
        self.update();
    }

    /// Drops interest without touching the poller.
    pub(crate) fn clear_interest(&self) {
        self.events.store(NONE_EVENT, Ordering::Release);
    }

    /// Unregisters from the owning loop. Interest must already be cleared.
    pub fn remove(self: &Arc<Self>) {
        assert!(
            self.is_none_event(),
            "Channel::remove fd = {} with interest {}",
            self.fd,
            self.events_to_string()
        );
        self.added_to_loop.store(false, Ordering::Release);
        if let Some(event_loop) = self.owner.upgrade() {
            event_loop.remove_channel(self);
        }
    }

    fn update(self: &Arc<Self>) {
        self.added_to_loop.store(true, Ordering::Release);
        if let Some(event_loop) = self.owner.upgrade() {
            event_loop.update_channel(self);
        }
    }

    /// Dispatches the events last returned by the poller.
    pub fn handle_event(&self, receive_time: Timestamp) {
        let tie = self.tie.lock().clone();
        match tie {
            Some(weak) => {
                if let Some(_guard) = weak.upgrade() {
                    self.handle_event_with_guard(receive_time);
                }
            }
            None => self.handle_event_with_guard(receive_time),
        }
    }

    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        self.event_handling.store(true, Ordering::Release);
        let revents = self.revents();
        trace!("fd = {} revents = {}", self.fd, self.revents_to_string());

        if revents & POLLHUP != 0 && revents & POLLIN == 0 {
            if self.log_hup.load(Ordering::Relaxed) {
                warn!("fd = {} Channel::handle_event() POLLHUP", self.fd);
            }
            let cb = self.close_callback.lock().clone();
            if let Some(cb) = cb {
                cb();
            }
        }

        if revents & POLLNVAL != 0 {
            warn!("fd = {} Channel::handle_event() POLLNVAL", self.fd);
        }

        if revents & (POLLERR | POLLNVAL) != 0 {
            let cb = self.error_callback.lock().clone();
            if let Some(cb) = cb {
                cb();
            }
        }

        if revents & (POLLIN | POLLPRI | POLLRDHUP) != 0 {
            let cb = self.read_callback.lock().clone();
            if let Some(cb) = cb {
                cb(receive_time);
            }
        }

        if revents & POLLOUT != 0 {
            let cb = self.write_callback.lock().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
        self.event_handling.store(false, Ordering::Release);
    }

    pub fn events_to_string(&self) -> String {
        events_to_string(self.fd, self.events())
    }

    pub fn revents_to_string(&self) -> String {
        events_to_string(self.fd, self.revents())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.load(Ordering::Acquire));
        if self.added_to_loop.load(Ordering::Acquire) {
            trace!("fd = {} channel dropped while still added to a loop", self.fd);
        }
    }
}

fn events_to_string(fd: RawFd, ev: u32) -> String {
    let mut out = format!("{}: ", fd);
    for (bit, name) in [
        (POLLIN, "IN "),
        (POLLPRI, "PRI "),
        (POLLOUT, "OUT "),
        (POLLHUP, "HUP "),
        (POLLRDHUP, "RDHUP "),
        (POLLERR, "ERR "),
        (POLLNVAL, "NVAL "),
    ] {
        if ev & bit != 0 {
            let _ = write!(out, "{}", name);
        }
    }
    out
}
