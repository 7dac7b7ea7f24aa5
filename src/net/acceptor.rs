use std::{
    fs::File,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::socket::Socket;
use crate::{channel::Channel, event_loop::EventLoop};

pub type NewConnectionCallback = Arc<dyn Fn(Socket, SocketAddr) + Send + Sync>;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Listening socket that hands every accepted peer to a callback.
///
/// Keeps a spare descriptor on `/dev/null` so that it can still accept and
/// drop a peer once the process runs out of descriptors.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    socket: Socket,
    channel: Arc<Channel>,
    listening: AtomicBool,
    retry_scheduled: AtomicBool,
    idle_fd: Mutex<Option<File>>,
    callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Self>> {
        let socket = Socket::new_nonblocking(listen_addr)?;
        socket.set_reuse_addr(true);
        socket.set_reuse_port(reuse_port);
        socket.bind(listen_addr)?;
        let idle_fd = File::open("/dev/null")?;
        let channel = Channel::new(event_loop, socket.fd());

        let acceptor = Arc::new(Self {
            event_loop: event_loop.clone(),
            socket,
            channel,
            listening: AtomicBool::new(false),
            retry_scheduled: AtomicBool::new(false),
            idle_fd: Mutex::new(Some(idle_fd)),
            callback: Mutex::new(None),
        });
        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: Fn(Socket, SocketAddr) + Send + Sync + 'static,
    {
        *self.callback.lock() = Some(Arc::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// The bound address, with the real port when bound to port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn listen(&self) -> io::Result<()> {
        self.event_loop.assert_in_loop_thread();
        self.socket.listen()?;
        self.listening.store(true, Ordering::Release);
        self.channel.enable_reading();
        Ok(())
    }

    /// Stops accepting and unregisters from the loop.
    pub fn close(&self) {
        self.event_loop.assert_in_loop_thread();
        self.listening.store(false, Ordering::Release);
        self.channel.disable_all();
        self.channel.remove();
    }

    /// Accepts until the backlog is empty. Readiness is edge-triggered, so
    /// stopping on any other error schedules another pass.
    fn handle_read(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        loop {
            match self.socket.accept() {
                Ok((conn, peer)) => {
                    let cb = self.callback.lock().clone();
                    match cb {
                        Some(cb) => cb(conn, peer),
                        None => drop(conn),
                    }
                }
                Err(e) => match e.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR | libc::ECONNABORTED | libc::EPROTO | libc::EPERM) => {
                        debug!("Acceptor::handle_read transient accept error: {}", e);
                    }
                    Some(libc::EMFILE) => {
                        error!("Acceptor::handle_read out of descriptors, shedding one peer");
                        if !self.shed_one_peer() {
                            self.retry_later();
                            break;
                        }
                    }
                    Some(
                        libc::EBADF
                        | libc::EFAULT
                        | libc::EINVAL
                        | libc::ENOTSOCK
                        | libc::EOPNOTSUPP,
                    ) => panic!("unexpected error of accept: {}", e),
                    _ => {
                        error!("Acceptor::handle_read unknown error of accept: {}", e);
                        self.retry_later();
                        break;
                    }
                },
            }
        }
    }

    fn retry_later(self: &Arc<Self>) {
        if self.retry_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            "Acceptor::handle_read stopped before the backlog drained, retrying in {:?}",
            ACCEPT_RETRY_DELAY
        );
        let weak = Arc::downgrade(self);
        self.event_loop.run_after(ACCEPT_RETRY_DELAY, move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.retry_scheduled.store(false, Ordering::Release);
                if acceptor.listening() {
                    acceptor.handle_read();
                }
            }
        });
    }

    /// Frees the spare descriptor, accepts and closes one peer, then
    /// reclaims the spare. Returns false once no spare can be reopened.
    fn shed_one_peer(&self) -> bool {
        let mut idle = self.idle_fd.lock();
        idle.take();
        if let Ok((peer, _)) = self.socket.accept() {
            drop(peer);
        }
        *idle = File::open("/dev/null").ok();
        idle.is_some()
    }
}
