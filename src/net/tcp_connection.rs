use std::{
    any::Any,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{
    socket::Socket, CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    TcpConnectionPtr, WriteCompleteCallback,
};
use crate::{buffer::Buffer, channel::Channel, event_loop::EventLoop, timestamp::Timestamp};

pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "kDisconnected",
            ConnectionState::Connecting => "kConnecting",
            ConnectionState::Connected => "kConnected",
            ConnectionState::Disconnecting => "kDisconnecting",
        }
    }
}

#[derive(Clone, Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One established TCP connection, shared by server/client and user code.
///
/// Lives on one loop. Events and callbacks run on that loop's thread;
/// `send`, `shutdown` and the close methods may be called from any thread.
/// Keepalive is enabled on construction.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    destroyed: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    callbacks: Mutex<Callbacks>,
    high_water_mark: AtomicUsize,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    context: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl TcpConnection {
    pub fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let channel = Channel::new(&event_loop, socket.fd());
        socket.set_keep_alive(true);
        let conn = Arc::new_cyclic(|weak: &Weak<TcpConnection>| {
            let w = weak.clone();
            channel.set_read_callback(move |receive_time| {
                if let Some(conn) = w.upgrade() {
                    conn.handle_read(receive_time);
                }
            });
            let w = weak.clone();
            channel.set_write_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_write();
                }
            });
            let w = weak.clone();
            channel.set_close_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_close();
                }
            });
            let w = weak.clone();
            channel.set_error_callback(move || {
                if let Some(conn) = w.upgrade() {
                    conn.handle_error();
                }
            });
            TcpConnection {
                event_loop,
                name,
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                reading: AtomicBool::new(true),
                destroyed: AtomicBool::new(false),
                socket,
                channel,
                local_addr,
                peer_addr,
                callbacks: Mutex::new(Callbacks::default()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                input: Mutex::new(Buffer::new()),
                output: Mutex::new(Buffer::new()),
                context: Mutex::new(None),
            }
        });
        debug!(
            "TcpConnection::ctor[{}] at {:p} fd={}",
            conn.name,
            Arc::as_ptr(&conn),
            conn.socket.fd()
        );
        conn
    }

    pub fn get_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    pub fn tcp_info_string(&self) -> Option<String> {
        self.socket.tcp_info_string()
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_no_delay(on);
    }

    pub fn set_context(&self, context: Arc<dyn Any + Send + Sync>) {
        *self.context.lock() = Some(context);
    }

    pub fn context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.context.lock().clone()
    }

    /// The context downcast to `T`, if it is one.
    pub fn context_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.context().and_then(|ctx| ctx.downcast::<T>().ok())
    }

    pub fn clear_context(&self) {
        self.context.lock().take();
    }

    /// Bytes queued for sending but not yet accepted by the kernel.
    pub fn pending_output_bytes(&self) -> usize {
        self.output.lock().readable_bytes()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, high_water_mark: usize) {
        self.callbacks.lock().high_water_mark = Some(cb);
        self.high_water_mark.store(high_water_mark, Ordering::Release);
    }

    /// Internal use by server and client.
    pub fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().close = Some(cb);
    }

    fn callbacks(&self) -> Callbacks {
        self.callbacks.lock().clone()
    }

    /// Sends `data`. Dropped silently unless connected.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.clone();
            let data = data.to_vec();
            self.event_loop.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Sends and drains the readable bytes of `buf`.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(buf.peek());
            buf.retrieve_all();
        } else {
            let conn = self.clone();
            let data = buf.retrieve_as_bytes(buf.readable_bytes());
            self.event_loop.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            warn!("disconnected, give up writing");
            return;
        }
        let mut nwrote = 0;
        let mut fault_error = false;
        let mut output = self.output.lock();

        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    if n == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!("TcpConnection::send_in_loop [{}]: {}", self.name, e);
                    if matches!(e.raw_os_error(), Some(libc::EPIPE | libc::ECONNRESET)) {
                        fault_error = true;
                    }
                }
            }
        }

        let remaining = data.len() - nwrote;
        if !fault_error && remaining > 0 {
            let old_len = output.readable_bytes();
            let mark = self.high_water_mark.load(Ordering::Acquire);
            if old_len + remaining >= mark && old_len < mark {
                if let Some(cb) = self.callbacks.lock().high_water_mark.clone() {
                    let conn = self.clone();
                    let queued = old_len + remaining;
                    self.event_loop.queue_in_loop(move || cb(&conn, queued));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn queue_write_complete(self: &Arc<Self>) {
        if let Some(cb) = self.callbacks.lock().write_complete.clone() {
            let conn = self.clone();
            self.event_loop.queue_in_loop(move || cb(&conn));
        }
    }

    /// Half-closes once everything queued has been written.
    pub fn shutdown(self: &Arc<Self>) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = self.clone();
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    /// Closes without waiting for queued output.
    pub fn force_close(self: &Arc<Self>) {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            self.set_state(ConnectionState::Disconnecting);
            let conn = self.clone();
            self.event_loop.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            self.set_state(ConnectionState::Disconnecting);
            let weak = Arc::downgrade(self);
            self.event_loop.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            self.handle_close();
        }
    }

    pub fn start_read(self: &Arc<Self>) {
        let conn = self.clone();
        self.event_loop.run_in_loop(move || {
            if !conn.is_reading() || !conn.channel.is_reading() {
                conn.channel.enable_reading();
                conn.reading.store(true, Ordering::Release);
            }
        });
    }

    pub fn stop_read(self: &Arc<Self>) {
        let conn = self.clone();
        self.event_loop.run_in_loop(move || {
            if conn.is_reading() || conn.channel.is_reading() {
                conn.channel.disable_reading();
                conn.reading.store(false, Ordering::Release);
            }
        });
    }

    /// Called once by the owner after it has installed its callbacks.
    pub fn connect_established(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.state(), ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);
        let tie: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(&tie);
        self.channel.enable_reading();
        if let Some(cb) = self.callbacks().connection {
            cb(self);
        }
    }

    /// Called once by the owner when it forgets the connection.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.callbacks().connection {
                cb(self);
            }
        }
        self.channel.disable_all();
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        self.event_loop.assert_in_loop_thread();
        let fd = self.socket.fd();
        let mut input = self.input.lock();
        let mut received = 0;
        let mut eof = false;
        let mut failure = None;
        loop {
            match input.read_fd(fd) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if received > 0 {
            if let Some(cb) = self.callbacks().message {
                cb(self, &mut *input, receive_time);
            }
        }
        drop(input);

        if eof {
            self.handle_close();
        } else if let Some(e) = failure {
            error!("TcpConnection::handle_read [{}]: {}", self.name, e);
            self.handle_error();
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("Connection fd = {} is down, no more writing", self.socket.fd());
            return;
        }
        let mut output = self.output.lock();
        while output.readable_bytes() > 0 {
            match self.socket.write(output.peek()) {
                Ok(n) => output.retrieve(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("TcpConnection::handle_write [{}]: {}", self.name, e);
                    break;
                }
            }
        }
        if output.readable_bytes() == 0 {
            drop(output);
            self.channel.disable_writing();
            self.queue_write_complete();
            if self.state() == ConnectionState::Disconnecting {
                self.shutdown_in_loop();
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        let state = self.state();
        trace!("fd = {} state = {}", self.socket.fd(), state.as_str());
        if !matches!(
            state,
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            return;
        }
        self.set_state(ConnectionState::Disconnected);
        self.channel.disable_all();

        let guard = self.clone();
        let callbacks = self.callbacks();
        if let Some(cb) = callbacks.connection {
            cb(&guard);
        }
        if let Some(cb) = callbacks.close {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        let err = match self.socket.take_error() {
            Ok(Some(e)) | Err(e) => e.to_string(),
            Ok(None) => "none".to_string(),
        };
        error!(
            "TcpConnection::handle_error [{}] - SO_ERROR = {}",
            self.name, err
        );
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::dtor[{}] at {:p} fd={} state={}",
            self.name,
            self,
            self.socket.fd(),
            self.state().as_str()
        );
    }
}
