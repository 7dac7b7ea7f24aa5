//! The per-thread reactor.
//!
//! An [`EventLoop`] belongs to the thread that created it. That thread runs
//! [`EventLoop::run`], polls its [`Poller`], dispatches ready channels and
//! then drains the queue of cross-thread tasks. Other threads interact with
//! a loop only through [`EventLoop::run_in_loop`], [`EventLoop::queue_in_loop`],
//! the timer methods and [`EventLoop::quit`]; each of those is safe to call
//! from anywhere.

use std::{
    cell::RefCell,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::{self, ThreadId},
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::{
    channel::Channel,
    config::EventLoopConfig,
    error::Result,
    poller::Poller,
    timer::TimerId,
    timer_queue::{create_timerfd, TimerQueue},
    timestamp::Timestamp,
};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static LOOP_IN_THIS_THREAD: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

fn create_eventfd() -> io::Result<OwnedFd> {
    // SAFETY: plain syscall; the result is checked before use.
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just created and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub struct EventLoop {
    thread_id: ThreadId,
    started: AtomicBool,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending: AtomicBool,
    iteration: AtomicU64,
    poll_return_time: AtomicI64,
    poll_timeout_ms: i32,
    poller: Mutex<Box<dyn Poller>>,
    timer_queue: TimerQueue,
    wakeup_fd: OwnedFd,
    wakeup_channel: Arc<Channel>,
    pending: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Creates a loop bound to the calling thread with the default configuration.
    ///
    /// # Panics
    ///
    /// Panics if another live loop already belongs to this thread.
    pub fn new() -> Result<Arc<Self>> {
        Self::with_config(EventLoopConfig::default())
    }

    pub fn with_config(config: EventLoopConfig) -> Result<Arc<Self>> {
        let thread_id = thread::current().id();
        if let Some(existing) = Self::event_loop_of_current_thread() {
            panic!(
                "Another EventLoop {:p} exists in this thread {:?}",
                Arc::as_ptr(&existing),
                thread_id
            );
        }

        let poller = config.poller.build()?;
        let wakeup_fd = create_eventfd()?;
        let timerfd = create_timerfd()?;
        let poll_timeout_ms = i32::try_from(config.poll_timeout.as_millis()).unwrap_or(i32::MAX);

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| {
            let wakeup_channel = Channel::with_owner(weak.clone(), wakeup_fd.as_raw_fd());
            let owner = weak.clone();
            wakeup_channel.set_read_callback(move |_| {
                if let Some(event_loop) = owner.upgrade() {
                    event_loop.handle_wakeup();
                }
            });
            EventLoop {
                thread_id,
                started: AtomicBool::new(false),
                looping: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                event_handling: AtomicBool::new(false),
                calling_pending: AtomicBool::new(false),
                iteration: AtomicU64::new(0),
                poll_return_time: AtomicI64::new(Timestamp::invalid().micros_since_epoch()),
                poll_timeout_ms,
                poller: Mutex::new(poller),
                timer_queue: TimerQueue::new(weak.clone(), timerfd),
                wakeup_fd,
                wakeup_channel,
                pending: Mutex::new(Vec::new()),
            }
        });

        LOOP_IN_THIS_THREAD.with(|current| *current.borrow_mut() = Arc::downgrade(&event_loop));
        event_loop.wakeup_channel.enable_reading();
        event_loop.timer_queue.start();
        debug!(
            "EventLoop created {:p} in thread {:?} using {}",
            Arc::as_ptr(&event_loop),
            thread_id,
            config.poller
        );
        Ok(event_loop)
    }

    /// The loop owned by the calling thread, if one is alive.
    pub fn event_loop_of_current_thread() -> Option<Arc<EventLoop>> {
        LOOP_IN_THIS_THREAD
            .try_with(|current| current.borrow().upgrade())
            .ok()
            .flatten()
    }

    /// Runs the reactor until [`quit`](Self::quit) is observed.
    ///
    /// Must be called on the owning thread, at most once. Pending tasks and
    /// timers still queued when the loop stops are dropped without running.
    pub fn run(&self) {
        assert!(
            !self.looping.load(Ordering::Acquire),
            "EventLoop::run() called while already looping"
        );
        self.assert_in_loop_thread();
        assert!(
            !self.started.swap(true, Ordering::AcqRel),
            "EventLoop::run() may only be called once"
        );
        self.looping.store(true, Ordering::Release);
        trace!("EventLoop {:p} start looping", self);

        let mut active_channels = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active_channels.clear();
            let receive_time = self.poller.lock().poll(self.poll_timeout_ms, &mut active_channels);
            self.poll_return_time
                .store(receive_time.micros_since_epoch(), Ordering::Release);
            self.iteration.fetch_add(1, Ordering::Relaxed);

            self.event_handling.store(true, Ordering::Release);
            for channel in &active_channels {
                channel.handle_event(receive_time);
            }
            self.event_handling.store(false, Ordering::Release);
            self.do_pending_tasks();
        }

        trace!("EventLoop {:p} stop looping", self);
        self.looping.store(false, Ordering::Release);
        drop(active_channels);
        let leftovers = std::mem::take(&mut *self.pending.lock());
        if !leftovers.is_empty() {
            debug!("EventLoop {:p} dropping {} pending tasks", self, leftovers.len());
        }
        drop(leftovers);
        self.timer_queue.clear();
    }

    /// Asks the loop to stop after the current iteration.
    ///
    /// Tasks queued before `quit` are not guaranteed to run.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` now when called on the loop thread, otherwise queues it.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` to run after the current (or next) dispatch round.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.lock().push(Box::new(task));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn run_at<F>(&self, when: Timestamp, callback: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timer_queue
            .add_timer(Box::new(callback), when, Duration::ZERO)
    }

    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.run_at(Timestamp::now() + delay, callback)
    }

    /// Fires every `interval`, first after one interval. A zero interval fires once.
    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timer_queue
            .add_timer(Box::new(callback), Timestamp::now() + interval, interval)
    }

    pub fn cancel(&self, timer_id: &TimerId) {
        self.timer_queue.cancel(timer_id);
    }

    pub fn timer_queue(&self) -> &TimerQueue {
        &self.timer_queue
    }

    pub fn wakeup(&self) {
        let one: u64 = 1;
        // SAFETY: writes 8 bytes from a live u64 to our own eventfd.
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                (&one as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            error!("EventLoop::wakeup() writes {} bytes instead of 8", n);
        }
    }

    fn handle_wakeup(&self) {
        let mut one: u64 = 0;
        // SAFETY: reads at most 8 bytes into a live u64.
        let n = unsafe {
            libc::read(
                self.wakeup_fd.as_raw_fd(),
                (&mut one as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n != std::mem::size_of::<u64>() as isize {
            error!("EventLoop::handle_wakeup() reads {} bytes instead of 8", n);
        }
    }

    fn do_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);
        let tasks = std::mem::take(&mut *self.pending.lock());
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        assert!(channel.is_owned_by(self), "channel fd = {} belongs to another loop", channel.fd());
        self.assert_in_loop_thread();
        self.poller.lock().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        assert!(channel.is_owned_by(self), "channel fd = {} belongs to another loop", channel.fd());
        self.assert_in_loop_thread();
        self.poller.lock().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        assert!(channel.is_owned_by(self));
        self.assert_in_loop_thread();
        self.poller.lock().has_channel(channel)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.thread_id == thread::current().id()
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop::assert_in_loop_thread - EventLoop {:p} was created in thread {:?}, current thread is {:?}",
                self,
                self.thread_id,
                thread::current().id()
            );
        }
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    pub fn is_event_handling(&self) -> bool {
        self.event_handling.load(Ordering::Acquire)
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    pub fn poll_return_time(&self) -> Timestamp {
        Timestamp::new(self.poll_return_time.load(Ordering::Acquire))
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    fn detach(&self, channel: &Arc<Channel>) {
        let mut poller = self.poller.lock();
        channel.clear_interest();
        poller.update_channel(channel);
        poller.remove_channel(channel);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!(
            "EventLoop {:p} of thread {:?} destructs in thread {:?}",
            self,
            self.thread_id,
            thread::current().id()
        );
        self.detach(&self.wakeup_channel);
        self.detach(self.timer_queue.channel());
        if self.is_in_loop_thread() {
            let _ = LOOP_IN_THIS_THREAD.try_with(|current| {
                if let Ok(mut current) = current.try_borrow_mut() {
                    *current = Weak::new();
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::PollerKind;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn one_loop_per_thread() {
        let event_loop = EventLoop::new().unwrap();
        assert!(event_loop.is_in_loop_thread());
        let current = EventLoop::event_loop_of_current_thread().unwrap();
        assert!(Arc::ptr_eq(&current, &event_loop));

        let second = std::panic::catch_unwind(|| EventLoop::new());
        assert!(second.is_err());

        drop(current);
        drop(event_loop);
        assert!(EventLoop::event_loop_of_current_thread().is_none());
        let again = EventLoop::new().unwrap();
        drop(again);
    }

    #[test]
    fn quit_from_another_thread() {
        let event_loop = EventLoop::new().unwrap();
        let remote = event_loop.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.quit();
        });
        event_loop.run();
        handle.join().unwrap();
        assert!(!event_loop.is_looping());
        assert!(event_loop.iteration() >= 1);
        assert!(event_loop.poll_return_time().is_valid());
    }

    #[test]
    fn cross_thread_tasks_run_on_loop_thread() {
        let event_loop = EventLoop::new().unwrap();
        let loop_thread = thread::current().id();
        let hits = Arc::new(AtomicUsize::new(0));

        let remote = event_loop.clone();
        let h = hits.clone();
        let handle = thread::spawn(move || {
            for _ in 0..10 {
                let h = h.clone();
                remote.run_in_loop(move || {
                    assert_eq!(thread::current().id(), loop_thread);
                    h.fetch_add(1, Ordering::SeqCst);
                });
            }
            let weak = Arc::downgrade(&remote);
            remote.queue_in_loop(move || {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.quit();
                }
            });
        });
        event_loop.run();
        handle.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn task_queued_from_pending_runs_next_round() {
        let event_loop = EventLoop::with_config(
            EventLoopConfig::builder()
                .poll_timeout(Duration::from_secs(30))
                .build(),
        )
        .unwrap();
        let weak = Arc::downgrade(&event_loop);
        let start = std::time::Instant::now();
        event_loop.run_after(Duration::from_millis(1), move || {
            if let Some(event_loop) = weak.upgrade() {
                let inner = Arc::downgrade(&event_loop);
                event_loop.queue_in_loop(move || {
                    if let Some(event_loop) = inner.upgrade() {
                        let last = Arc::downgrade(&event_loop);
                        event_loop.queue_in_loop(move || {
                            if let Some(event_loop) = last.upgrade() {
                                event_loop.quit();
                            }
                        });
                    }
                });
            }
        });
        event_loop.run();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn run_in_loop_is_synchronous_on_owner() {
        let event_loop = EventLoop::new().unwrap();
        let hit = Arc::new(AtomicBool::new(false));
        let h = hit.clone();
        event_loop.run_in_loop(move || h.store(true, Ordering::SeqCst));
        assert!(hit.load(Ordering::SeqCst));
        assert_eq!(event_loop.queue_size(), 0);
    }

    #[test]
    fn poll_backend_runs_timers() {
        let event_loop = EventLoop::with_config(
            EventLoopConfig::builder().poller(PollerKind::Poll).build(),
        )
        .unwrap();
        let weak = Arc::downgrade(&event_loop);
        event_loop.run_after(Duration::from_millis(10), move || {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.quit();
            }
        });
        event_loop.run();
        assert!(event_loop.iteration() >= 1);
    }

    #[test]
    #[should_panic(expected = "assert_in_loop_thread")]
    fn foreign_thread_cannot_update_channels() {
        let event_loop = EventLoop::new().unwrap();
        let channel = Channel::new(&event_loop, event_loop.wakeup_fd.as_raw_fd());
        let remote = event_loop.clone();
        let result = thread::spawn(move || remote.update_channel(&channel)).join();
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }
}
