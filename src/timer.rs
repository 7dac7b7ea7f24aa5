use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use crate::timestamp::Timestamp;

pub type TimerCallback = Box<dyn Fn() + Send + Sync + 'static>;

static NUM_CREATED: AtomicI64 = AtomicI64::new(0);

/// A scheduled callback, optionally repeating.
///
/// The callback and interval never change; only the expiration moves when a
/// repeating timer is re-armed.
pub struct Timer {
    callback: TimerCallback,
    expiration: AtomicI64,
    interval: Duration,
    sequence: i64,
}

impl Timer {
    pub fn new(callback: TimerCallback, when: Timestamp, interval: Duration) -> Self {
        Self {
            callback,
            expiration: AtomicI64::new(when.micros_since_epoch()),
            interval,
            sequence: NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    pub fn run(&self) {
        (self.callback)();
    }

    pub fn expiration(&self) -> Timestamp {
        Timestamp::new(self.expiration.load(Ordering::Acquire))
    }

    pub fn repeat(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Moves the next expiration to `now + interval`, or invalidates a one-shot timer.
    pub fn restart(&self, now: Timestamp) {
        let next = if self.repeat() {
            now + self.interval
        } else {
            Timestamp::invalid()
        };
        self.expiration
            .store(next.micros_since_epoch(), Ordering::Release);
    }

    pub fn num_created() -> i64 {
        NUM_CREATED.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("expiration", &self.expiration())
            .field("interval", &self.interval)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Opaque handle used to cancel a timer.
///
/// Holds only a weak reference; a `TimerId` never keeps a timer alive.
/// Equality is by sequence number.
#[derive(Clone)]
pub struct TimerId {
    timer: Weak<Timer>,
    sequence: i64,
}

impl TimerId {
    pub(crate) fn new(timer: &Arc<Timer>) -> Self {
        Self {
            timer: Arc::downgrade(timer),
            sequence: timer.sequence(),
        }
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// Whether the timer is still held by its queue (or being fired).
    pub fn is_alive(&self) -> bool {
        self.timer.strong_count() > 0
    }
}

impl PartialEq for TimerId {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for TimerId {}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerId({})", self.sequence)
    }
}
