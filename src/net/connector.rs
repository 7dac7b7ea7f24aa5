use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::socket::Socket;
use crate::{channel::Channel, event_loop::EventLoop, timer::TimerId};

pub const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

pub type NewConnectionCallback = Arc<dyn Fn(Socket) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectorState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectorState::Connecting,
            2 => ConnectorState::Connected,
            _ => ConnectorState::Disconnected,
        }
    }
}

/// Drives one outgoing connect attempt at a time, retrying with backoff.
///
/// The retry delay starts at 500 ms and doubles up to 30 s.
pub struct Connector {
    event_loop: Arc<EventLoop>,
    server_addr: SocketAddr,
    connect: AtomicBool,
    state: AtomicU8,
    channel: Mutex<Option<Arc<Channel>>>,
    socket: Mutex<Option<Socket>>,
    callback: Mutex<Option<NewConnectionCallback>>,
    retry_delay: Mutex<Duration>,
    retry_timer: Mutex<Option<TimerId>>,
    weak_self: Weak<Connector>,
}

impl Connector {
    pub fn new(event_loop: &Arc<EventLoop>, server_addr: SocketAddr) -> Arc<Self> {
        let connector = Arc::new_cyclic(|weak| Self {
            event_loop: event_loop.clone(),
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(ConnectorState::Disconnected as u8),
            channel: Mutex::new(None),
            socket: Mutex::new(None),
            callback: Mutex::new(None),
            retry_delay: Mutex::new(INIT_RETRY_DELAY),
            retry_timer: Mutex::new(None),
            weak_self: weak.clone(),
        });
        debug!("Connector ctor[{:p}]", Arc::as_ptr(&connector));
        connector
    }

    /// Receives the connected socket. Runs on the loop thread.
    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: Fn(Socket) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Arc::new(cb));
    }

    pub fn server_address(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn state(&self) -> ConnectorState {
        ConnectorState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Delay that the next retry will wait.
    pub fn retry_delay(&self) -> Duration {
        *self.retry_delay.lock()
    }

    fn set_state(&self, state: ConnectorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Begins connecting. Callable from any thread.
    pub fn start(&self) {
        self.connect.store(true, Ordering::Release);
        let weak = self.weak_self.clone();
        self.event_loop.run_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.start_in_loop();
            }
        });
    }

    /// Restarts from scratch with the initial retry delay. Loop thread only.
    pub fn restart(&self) {
        self.event_loop.assert_in_loop_thread();
        self.set_state(ConnectorState::Disconnected);
        *self.retry_delay.lock() = INIT_RETRY_DELAY;
        self.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    /// Abandons any attempt in flight and cancels a scheduled retry.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        let weak = self.weak_self.clone();
        self.event_loop.queue_in_loop(move || {
            if let Some(connector) = weak.upgrade() {
                connector.stop_in_loop();
            }
        });
    }

    fn start_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state() != ConnectorState::Disconnected {
            debug!("Connector::start_in_loop already {:?}", self.state());
            return;
        }
        if self.connect.load(Ordering::Acquire) {
            self.connect_now();
        } else {
            debug!("do not connect");
        }
    }

    fn stop_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if let Some(timer) = self.retry_timer.lock().take() {
            self.event_loop.cancel(&timer);
        }
        if self.state() == ConnectorState::Connecting {
            self.set_state(ConnectorState::Disconnected);
            if let Some(socket) = self.remove_and_reset_channel() {
                self.retry(socket);
            }
        }
    }

    fn connect_now(&self) {
        let socket = match Socket::new_nonblocking(&self.server_addr) {
            Ok(socket) => socket,
            Err(e) => {
                error!("Connector::connect_now socket creation failed: {}", e);
                return;
            }
        };
        let errno = match socket.connect(&self.server_addr) {
            Ok(()) => 0,
            Err(e) => e.raw_os_error().unwrap_or(-1),
        };
        match errno {
            0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => self.connecting(socket),
            libc::EAGAIN
            | libc::EADDRINUSE
            | libc::EADDRNOTAVAIL
            | libc::ECONNREFUSED
            | libc::ENETUNREACH => self.retry(socket),
            libc::EACCES
            | libc::EPERM
            | libc::EAFNOSUPPORT
            | libc::EALREADY
            | libc::EBADF
            | libc::EFAULT
            | libc::ENOTSOCK => {
                error!("connect error in Connector::connect_now {}", errno);
            }
            _ => {
                error!("Unexpected error in Connector::connect_now {}", errno);
            }
        }
    }

    fn connecting(&self, socket: Socket) {
        self.set_state(ConnectorState::Connecting);
        let channel = Channel::new(&self.event_loop, socket.fd());
        let weak = self.weak_self.clone();
        channel.set_write_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        });
        let weak = self.weak_self.clone();
        channel.set_error_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        });
        *self.socket.lock() = Some(socket);
        {
            let mut slot = self.channel.lock();
            assert!(slot.is_none(), "Connector already owns a channel");
            *slot = Some(channel.clone());
        }
        channel.enable_writing();
    }

    /// Unregisters the connecting channel and hands back its socket.
    fn remove_and_reset_channel(&self) -> Option<Socket> {
        let channel = self.channel.lock().take();
        if let Some(channel) = channel {
            channel.disable_all();
            channel.remove();
        }
        self.socket.lock().take()
    }

    fn handle_write(&self) {
        trace!("Connector::handle_write state = {:?}", self.state());
        if self.state() != ConnectorState::Connecting {
            assert_eq!(self.state(), ConnectorState::Disconnected);
            return;
        }
        let Some(socket) = self.remove_and_reset_channel() else {
            return;
        };
        match socket.take_error() {
            Ok(Some(e)) | Err(e) => {
                warn!("Connector::handle_write - SO_ERROR = {}", e);
                self.retry(socket);
            }
            Ok(None) if socket.is_self_connect() => {
                warn!("Connector::handle_write - Self connect");
                self.retry(socket);
            }
            Ok(None) => {
                self.set_state(ConnectorState::Connected);
                let cb = self.callback.lock().clone();
                match cb {
                    Some(cb) if self.connect.load(Ordering::Acquire) => cb(socket),
                    _ => drop(socket),
                }
            }
        }
    }

    fn handle_error(&self) {
        error!("Connector::handle_error state = {:?}", self.state());
        if self.state() == ConnectorState::Connecting {
            if let Some(socket) = self.remove_and_reset_channel() {
                if let Ok(Some(e)) = socket.take_error() {
                    trace!("SO_ERROR = {}", e);
                }
                self.retry(socket);
            }
        }
    }

    fn retry(&self, socket: Socket) {
        drop(socket);
        self.set_state(ConnectorState::Disconnected);
        if !self.connect.load(Ordering::Acquire) {
            debug!("do not connect");
            return;
        }
        let delay = {
            let mut retry_delay = self.retry_delay.lock();
            let delay = *retry_delay;
            *retry_delay = (delay * 2).min(MAX_RETRY_DELAY);
            delay
        };
        info!(
            "Connector::retry - Retry connecting to {} in {} milliseconds.",
            self.server_addr,
            delay.as_millis()
        );
        let weak = self.weak_self.clone();
        let timer = self.event_loop.run_after(delay, move || {
            if let Some(connector) = weak.upgrade() {
                connector.retry_timer.lock().take();
                connector.start_in_loop();
            }
        });
        *self.retry_timer.lock() = Some(timer);
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        debug!("Connector dtor[{:p}]", self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn unused_port() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    #[test]
    fn connects_to_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let event_loop = EventLoop::new().unwrap();
        let connector = Connector::new(&event_loop, listener.local_addr().unwrap());
        let weak = Arc::downgrade(&event_loop);
        let peer = Arc::new(Mutex::new(None));
        let p = peer.clone();
        connector.set_new_connection_callback(move |socket| {
            *p.lock() = socket.peer_addr().ok();
            if let Some(event_loop) = weak.upgrade() {
                event_loop.quit();
            }
        });
        connector.start();
        event_loop.run();
        assert_eq!(*peer.lock(), Some(listener.local_addr().unwrap()));
        assert_eq!(connector.state(), ConnectorState::Connected);
    }

    #[test]
    fn refused_connect_backs_off() {
        let event_loop = EventLoop::new().unwrap();
        let connector = Connector::new(&event_loop, unused_port());
        let connected = Arc::new(AtomicUsize::new(0));
        let c = connected.clone();
        connector.set_new_connection_callback(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        connector.start();

        let weak = Arc::downgrade(&event_loop);
        event_loop.run_after(Duration::from_millis(1200), move || {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.quit();
            }
        });
        event_loop.run();

        assert_eq!(connected.load(Ordering::SeqCst), 0);
        // 500 ms and 1 s attempts have been scheduled.
        assert!(connector.retry_delay() >= Duration::from_secs(2));
        assert_ne!(connector.state(), ConnectorState::Connected);
    }

    #[test]
    fn delay_is_capped() {
        let mut delay = INIT_RETRY_DELAY;
        for _ in 0..10 {
            delay = (delay * 2).min(MAX_RETRY_DELAY);
        }
        assert_eq!(delay, MAX_RETRY_DELAY);
    }
}
