//! Timers multiplexed onto a single `timerfd`.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::{
    channel::Channel,
    event_loop::EventLoop,
    timer::{Timer, TimerCallback, TimerId},
    timestamp::Timestamp,
};

const MIN_TIMER_DELAY_MICROS: i64 = 100;

type TimerKey = (Timestamp, i64);

#[derive(Default)]
struct TimerState {
    /// Ordered by expiration, ties broken by creation sequence.
    timers: BTreeMap<TimerKey, Arc<Timer>>,
    /// The same timers keyed by sequence.
    active: HashMap<i64, Arc<Timer>>,
    /// Timers cancelled from inside their own callback window.
    canceling: HashSet<i64>,
    calling_expired: bool,
}

/// The timer set of one [`EventLoop`].
///
/// Bookkeeping is only touched on the loop thread; `add_timer` and `cancel`
/// marshal there through [`EventLoop::run_in_loop`].
pub struct TimerQueue {
    owner: Weak<EventLoop>,
    timerfd: OwnedFd,
    channel: Arc<Channel>,
    state: Mutex<TimerState>,
}

pub(crate) fn create_timerfd() -> io::Result<OwnedFd> {
    // SAFETY: plain syscall; the result is checked before use.
    let fd = unsafe {
        libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just created and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn how_much_time_from_now(when: Timestamp) -> libc::timespec {
    let micros = (when.micros_since_epoch() - Timestamp::now().micros_since_epoch())
        .max(MIN_TIMER_DELAY_MICROS);
    // SAFETY: timespec is plain data.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    ts.tv_sec = (micros / Timestamp::MICROS_PER_SECOND) as libc::time_t;
    ts.tv_nsec = ((micros % Timestamp::MICROS_PER_SECOND) * 1000) as libc::c_long;
    ts
}

fn read_timerfd(fd: RawFd, now: Timestamp) {
    let mut howmany: u64 = 0;
    // SAFETY: reads at most 8 bytes into a live u64.
    let n = unsafe {
        libc::read(
            fd,
            (&mut howmany as *mut u64).cast(),
            std::mem::size_of::<u64>(),
        )
    };
    trace!("TimerQueue::handle_read() {} at {}", howmany, now);
    if n != std::mem::size_of::<u64>() as isize {
        error!("TimerQueue::handle_read() reads {} bytes instead of 8", n);
    }
}

fn reset_timerfd(fd: RawFd, expiration: Timestamp) {
    // SAFETY: itimerspec is plain data.
    let mut new_value: libc::itimerspec = unsafe { std::mem::zeroed() };
    let mut old_value: libc::itimerspec = unsafe { std::mem::zeroed() };
    new_value.it_value = how_much_time_from_now(expiration);
    // SAFETY: both pointers refer to live itimerspec values.
    let ret = unsafe { libc::timerfd_settime(fd, 0, &new_value, &mut old_value) };
    if ret != 0 {
        error!("timerfd_settime(): {}", io::Error::last_os_error());
    }
}

impl TimerQueue {
    pub(crate) fn new(owner: Weak<EventLoop>, timerfd: OwnedFd) -> Self {
        let channel = Channel::with_owner(owner.clone(), timerfd.as_raw_fd());
        let weak = owner.clone();
        channel.set_read_callback(move |_| {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.timer_queue().handle_read();
            }
        });
        Self {
            owner,
            timerfd,
            channel,
            state: Mutex::new(TimerState::default()),
        }
    }

    /// Starts watching the timerfd. Called once the owning loop exists.
    pub(crate) fn start(&self) {
        self.channel.enable_reading();
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Schedules `callback` at `when`, repeating every `interval` unless it is zero.
    ///
    /// Safe to call from any thread; insertion happens on the loop thread.
    pub fn add_timer(&self, callback: TimerCallback, when: Timestamp, interval: Duration) -> TimerId {
        let timer = Arc::new(Timer::new(callback, when, interval));
        let id = TimerId::new(&timer);
        if let Some(event_loop) = self.owner.upgrade() {
            let weak = self.owner.clone();
            event_loop.run_in_loop(move || {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.timer_queue().add_timer_in_loop(timer);
                }
            });
        }
        id
    }

    pub fn cancel(&self, timer_id: &TimerId) {
        if let Some(event_loop) = self.owner.upgrade() {
            let weak = self.owner.clone();
            let sequence = timer_id.sequence();
            event_loop.run_in_loop(move || {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.timer_queue().cancel_in_loop(sequence);
                }
            });
        }
    }

    /// Number of timers in the by-expiration set.
    pub fn len(&self) -> usize {
        self.state.lock().timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of timers in the by-identity set.
    pub fn active_len(&self) -> usize {
        self.state.lock().active.len()
    }

    fn assert_in_loop_thread(&self) {
        if let Some(event_loop) = self.owner.upgrade() {
            event_loop.assert_in_loop_thread();
        }
    }

    fn add_timer_in_loop(&self, timer: Arc<Timer>) {
        self.assert_in_loop_thread();
        let when = timer.expiration();
        let earliest_changed = {
            let mut state = self.state.lock();
            Self::insert(&mut state, timer)
        };
        if earliest_changed {
            reset_timerfd(self.timerfd.as_raw_fd(), when);
        }
    }

    fn cancel_in_loop(&self, sequence: i64) {
        self.assert_in_loop_thread();
        let mut state = self.state.lock();
        assert_eq!(state.timers.len(), state.active.len());
        if let Some(timer) = state.active.remove(&sequence) {
            let removed = state.timers.remove(&(timer.expiration(), sequence));
            assert!(removed.is_some(), "timer {} missing from the ordered set", sequence);
        } else if state.calling_expired {
            state.canceling.insert(sequence);
        }
        assert_eq!(state.timers.len(), state.active.len());
    }

    fn handle_read(&self) {
        self.assert_in_loop_thread();
        let now = Timestamp::now();
        read_timerfd(self.timerfd.as_raw_fd(), now);

        let expired = {
            let mut state = self.state.lock();
            let expired = Self::take_expired(&mut state, now);
            state.calling_expired = true;
            state.canceling.clear();
            expired
        };
        // No lock here: callbacks may add or cancel timers.
        for timer in &expired {
            timer.run();
        }
        let mut state = self.state.lock();
        state.calling_expired = false;
        self.reset(&mut state, expired, now);
    }

    /// Removes and returns every timer with expiration `<= now`, in firing order.
    fn take_expired(state: &mut TimerState, now: Timestamp) -> Vec<Arc<Timer>> {
        assert_eq!(state.timers.len(), state.active.len());
        let sentinel = (now.add_micros(1), i64::MIN);
        let later = state.timers.split_off(&sentinel);
        let due = std::mem::replace(&mut state.timers, later);
        let expired: Vec<Arc<Timer>> = due.into_values().collect();
        for timer in &expired {
            let removed = state.active.remove(&timer.sequence());
            assert!(removed.is_some());
        }
        assert_eq!(state.timers.len(), state.active.len());
        expired
    }

    fn reset(&self, state: &mut TimerState, expired: Vec<Arc<Timer>>, now: Timestamp) {
        for timer in expired {
            if timer.repeat() && !state.canceling.contains(&timer.sequence()) {
                timer.restart(now);
                Self::insert(state, timer);
            }
        }
        if let Some(((next_expire, _), _)) = state.timers.first_key_value() {
            if next_expire.is_valid() {
                reset_timerfd(self.timerfd.as_raw_fd(), *next_expire);
            }
        }
    }

    fn insert(state: &mut TimerState, timer: Arc<Timer>) -> bool {
        assert_eq!(state.timers.len(), state.active.len());
        let when = timer.expiration();
        let earliest_changed = state
            .timers
            .first_key_value()
            .map_or(true, |((first, _), _)| when < *first);
        let sequence = timer.sequence();
        state.timers.insert((when, sequence), timer.clone());
        state.active.insert(sequence, timer);
        assert_eq!(state.timers.len(), state.active.len());
        earliest_changed
    }

    /// Drops every pending timer. Used once the owning loop has stopped.
    pub(crate) fn clear(&self) {
        let (timers, active) = {
            let mut state = self.state.lock();
            state.canceling.clear();
            (
                std::mem::take(&mut state.timers),
                std::mem::take(&mut state.active),
            )
        };
        drop(timers);
        drop(active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn add_and_cancel_keep_sets_consistent() {
        let event_loop = EventLoop::new().unwrap();
        let queue = event_loop.timer_queue();
        assert!(queue.is_empty());

        let ids: Vec<_> = [5.0, 10.0, 15.0]
            .iter()
            .map(|secs| event_loop.run_at(Timestamp::now().add_seconds(*secs), || {}))
            .collect();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.active_len(), 3);

        event_loop.cancel(&ids[0]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.active_len(), 2);

        event_loop.cancel(&ids[0]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.active_len(), 2);

        event_loop.cancel(&ids[1]);
        event_loop.cancel(&ids[2]);
        assert!(queue.is_empty());
        assert_eq!(queue.active_len(), 0);
    }

    #[test]
    fn expired_timers_come_out_in_order() {
        let mut state = TimerState::default();
        let base = Timestamp::now().add_seconds(-1.0);
        let late = Arc::new(Timer::new(Box::new(|| {}), base.add_micros(30), Duration::ZERO));
        let early = Arc::new(Timer::new(Box::new(|| {}), base.add_micros(10), Duration::ZERO));
        let tie_a = Arc::new(Timer::new(Box::new(|| {}), base.add_micros(20), Duration::ZERO));
        let tie_b = Arc::new(Timer::new(Box::new(|| {}), base.add_micros(20), Duration::ZERO));
        let future = Arc::new(Timer::new(
            Box::new(|| {}),
            Timestamp::now().add_seconds(60.0),
            Duration::ZERO,
        ));
        for t in [&late, &tie_b, &future, &early, &tie_a] {
            TimerQueue::insert(&mut state, t.clone());
        }

        let expired = TimerQueue::take_expired(&mut state, Timestamp::now());
        let order: Vec<i64> = expired.iter().map(|t| t.sequence()).collect();
        assert_eq!(
            order,
            vec![early.sequence(), tie_a.sequence(), tie_b.sequence(), late.sequence()]
        );
        assert_eq!(state.timers.len(), 1);
        assert_eq!(state.active.len(), 1);
    }

    #[test]
    fn exact_now_is_expired() {
        let mut state = TimerState::default();
        let now = Timestamp::now();
        let t = Arc::new(Timer::new(Box::new(|| {}), now, Duration::ZERO));
        TimerQueue::insert(&mut state, t);
        assert_eq!(TimerQueue::take_expired(&mut state, now).len(), 1);
    }

    #[test]
    fn fires_and_repeats() {
        let event_loop = EventLoop::new().unwrap();
        let once = Arc::new(AtomicUsize::new(0));
        let every = Arc::new(AtomicUsize::new(0));

        let o = once.clone();
        event_loop.run_after(Duration::from_millis(10), move || {
            o.fetch_add(1, Ordering::SeqCst);
        });
        let e = every.clone();
        let weak = Arc::downgrade(&event_loop);
        event_loop.run_every(Duration::from_millis(20), move || {
            if e.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                if let Some(event_loop) = weak.upgrade() {
                    event_loop.quit();
                }
            }
        });
        event_loop.run();

        assert_eq!(once.load(Ordering::SeqCst), 1);
        assert_eq!(every.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancel_from_own_callback_stops_repeat() {
        let event_loop = EventLoop::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let slot: Arc<parking_lot::Mutex<Option<TimerId>>> = Arc::new(parking_lot::Mutex::new(None));

        let h = hits.clone();
        let s = slot.clone();
        let weak = Arc::downgrade(&event_loop);
        let id = event_loop.run_every(Duration::from_millis(5), move || {
            h.fetch_add(1, Ordering::SeqCst);
            if let (Some(event_loop), Some(id)) = (weak.upgrade(), s.lock().clone()) {
                event_loop.cancel(&id);
            }
        });
        *slot.lock() = Some(id);

        let weak = Arc::downgrade(&event_loop);
        event_loop.run_after(Duration::from_millis(60), move || {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.quit();
            }
        });
        event_loop.run();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
