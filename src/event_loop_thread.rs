//! Loops running on their own threads.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::{Builder, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::{
    config::EventLoopConfig,
    error::{Error, Result},
    event_loop::EventLoop,
};

/// Runs on the new loop's thread before the loop starts.
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

type Handoff = Arc<(Mutex<Option<Result<Arc<EventLoop>>>>, Condvar)>;

/// One named thread owning one [`EventLoop`].
///
/// Dropping it quits the loop and joins the thread.
pub struct EventLoopThread {
    name: String,
    config: EventLoopConfig,
    callback: Option<ThreadInitCallback>,
    event_loop: Option<Arc<EventLoop>>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(
        name: impl Into<String>,
        config: EventLoopConfig,
        callback: Option<ThreadInitCallback>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            callback,
            event_loop: None,
            thread: None,
        }
    }

    /// Spawns the thread and blocks until its loop exists.
    pub fn start_loop(&mut self) -> Result<Arc<EventLoop>> {
        assert!(self.thread.is_none(), "EventLoopThread {} already started", self.name);

        let handoff: Handoff = Arc::new((Mutex::new(None), Condvar::new()));
        let publish = handoff.clone();
        let callback = self.callback.clone();
        let config = self.config;
        let thread = Builder::new().name(self.name.clone()).spawn(move || {
            let (slot, ready) = &*publish;
            let event_loop = match EventLoop::with_config(config) {
                Ok(event_loop) => event_loop,
                Err(e) => {
                    *slot.lock() = Some(Err(e));
                    ready.notify_one();
                    return;
                }
            };
            if let Some(callback) = callback {
                callback(&event_loop);
            }
            *slot.lock() = Some(Ok(event_loop.clone()));
            ready.notify_one();
            event_loop.run();
        })?;

        let (slot, ready) = &*handoff;
        let mut guard = slot.lock();
        let published = loop {
            if let Some(result) = guard.take() {
                break result;
            }
            if thread.is_finished() {
                break Err(Error::LoopThreadExited(self.name.clone()));
            }
            ready.wait_for(&mut guard, Duration::from_millis(100));
        };
        drop(guard);
        self.thread = Some(thread);

        let event_loop = published?;
        debug!("EventLoopThread {} started", self.name);
        self.event_loop = Some(event_loop.clone());
        Ok(event_loop)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.quit();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("EventLoopThread {} panicked", self.name);
            }
        }
    }
}

/// A base loop plus `num_threads` I/O loops handed out round-robin.
///
/// With zero threads every request is answered with the base loop.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    config: EventLoopConfig,
    started: bool,
    num_threads: usize,
    next: AtomicUsize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: impl Into<String>) -> Self {
        Self {
            base_loop,
            name: name.into(),
            config: EventLoopConfig::default(),
            started: false,
            num_threads: 0,
            next: AtomicUsize::new(0),
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    pub fn set_loop_config(&mut self, config: EventLoopConfig) {
        self.config = config;
    }

    /// Starts the I/O threads. Runs `callback` once per loop, or once on the
    /// base loop when there are no threads.
    pub fn start(&mut self, callback: Option<ThreadInitCallback>) -> Result<()> {
        assert!(!self.started, "EventLoopThreadPool {} already started", self.name);
        self.base_loop.assert_in_loop_thread();
        self.started = true;

        for i in 0..self.num_threads {
            let mut thread =
                EventLoopThread::new(format!("{}{}", self.name, i), self.config, callback.clone());
            let event_loop = thread.start_loop()?;
            self.threads.push(thread);
            self.loops.push(event_loop);
        }
        if self.num_threads == 0 {
            if let Some(callback) = callback {
                callback(&self.base_loop);
            }
        }
        Ok(())
    }

    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started);
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index].clone()
    }

    /// The same hash always maps to the same loop.
    pub fn get_loop_for_hash(&self, hash_code: usize) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        if self.loops.is_empty() {
            return self.base_loop.clone();
        }
        self.loops[hash_code % self.loops.len()].clone()
    }

    pub fn get_all_loops(&self) -> Vec<Arc<EventLoop>> {
        self.base_loop.assert_in_loop_thread();
        assert!(self.started);
        if self.loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
