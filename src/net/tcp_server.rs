use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use lockfree::map::Map as LockfreeMap;
use parking_lot::Mutex;
use tracing::{error, info, trace};

use super::{
    acceptor::Acceptor, default_connection_callback, default_message_callback, socket::Socket,
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::{
    buffer::Buffer,
    config::TcpServerConfig,
    error::Result,
    event_loop::EventLoop,
    event_loop_thread::{EventLoopThreadPool, ThreadInitCallback},
    timestamp::Timestamp,
};

#[derive(Clone)]
struct ServerCallbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<ThreadInitCallback>,
}

/// Accepts on one loop and spreads connections over an I/O thread pool.
///
/// Connections are kept in a lock-free map keyed by their unique name,
/// `"{server}-{ip:port}#{id}"`.
pub struct TcpServer {
    event_loop: Arc<EventLoop>,
    ip_port: String,
    name: String,
    no_delay: bool,
    acceptor: Arc<Acceptor>,
    thread_pool: Mutex<EventLoopThreadPool>,
    callbacks: Mutex<ServerCallbacks>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: LockfreeMap<String, TcpConnectionPtr>,
    weak_self: Weak<TcpServer>,
}

impl TcpServer {
    /// Binds immediately; accepting begins with [`start`](Self::start).
    pub fn new(event_loop: &Arc<EventLoop>, config: TcpServerConfig) -> Result<Arc<Self>> {
        let acceptor = Acceptor::new(event_loop, &config.address, config.reuse_port)?;
        let ip_port = acceptor.local_addr()?.to_string();

        let mut pool = EventLoopThreadPool::new(event_loop.clone(), config.name.clone());
        pool.set_thread_num(config.num_threads);
        pool.set_loop_config(config.loop_config);

        let server = Arc::new_cyclic(|weak: &Weak<TcpServer>| TcpServer {
            event_loop: event_loop.clone(),
            ip_port,
            name: config.name,
            no_delay: config.no_delay,
            acceptor: acceptor.clone(),
            thread_pool: Mutex::new(pool),
            callbacks: Mutex::new(ServerCallbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
                thread_init: None,
            }),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: LockfreeMap::new(),
            weak_self: weak.clone(),
        });

        let weak = Arc::downgrade(&server);
        acceptor.set_new_connection_callback(move |socket, peer| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(socket, peer);
            }
        });
        Ok(server)
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// The bound address, with the real port when configured with port 0.
    pub fn listen_addr(&self) -> std::io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.iter().count()
    }

    pub fn set_connection_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        self.callbacks.lock().connection = Arc::new(cb);
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync + 'static,
    {
        self.callbacks.lock().message = Arc::new(cb);
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    {
        self.callbacks.lock().write_complete = Some(Arc::new(cb));
    }

    /// Runs on each I/O loop's thread before that loop starts.
    pub fn set_thread_init_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<EventLoop>) + Send + Sync + 'static,
    {
        self.callbacks.lock().thread_init = Some(Arc::new(cb));
    }

    /// Starts the I/O threads and begins listening. Idempotent; must be
    /// called on the server's loop thread.
    pub fn start(&self) -> Result<()> {
        self.event_loop.assert_in_loop_thread();
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let thread_init = self.callbacks.lock().thread_init.clone();
        self.thread_pool.lock().start(thread_init)?;
        assert!(!self.acceptor.listening());
        self.acceptor.listen()?;
        info!("TcpServer [{}] listening on {}", self.name, self.ip_port);
        Ok(())
    }

    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        self.event_loop.assert_in_loop_thread();
        let io_loop = self.thread_pool.lock().get_next_loop();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("TcpServer::new_connection [{}] - getsockname: {}", self.name, e);
                return;
            }
        };
        if self.no_delay {
            socket.set_tcp_no_delay(true);
        }

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);
        let callbacks = self.callbacks.lock().clone();
        conn.set_connection_callback(callbacks.connection);
        conn.set_message_callback(callbacks.message);
        if let Some(cb) = callbacks.write_complete {
            conn.set_write_complete_callback(cb);
        }
        let weak = self.weak_self.clone();
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            match weak.upgrade() {
                Some(server) => server.remove_connection(conn),
                None => destroy_later(conn),
            }
        }));
        self.connections.insert(conn_name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        let weak = self.weak_self.clone();
        let conn = conn.clone();
        self.event_loop.run_in_loop(move || match weak.upgrade() {
            Some(server) => server.remove_connection_in_loop(&conn),
            None => destroy_later(&conn),
        });
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.event_loop.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );
        let removed = self.connections.remove(conn.name());
        assert!(removed.is_some(), "unknown connection {}", conn.name());
        destroy_later(conn);
    }
}

/// Queues the final teardown on the connection's own loop.
fn destroy_later(conn: &TcpConnectionPtr) {
    let conn = conn.clone();
    let io_loop = conn.get_loop().clone();
    io_loop.queue_in_loop(move || conn.connect_destroyed());
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        trace!("TcpServer::drop [{}] destructing", self.name);
        let acceptor = self.acceptor.clone();
        self.event_loop.run_in_loop(move || acceptor.close());

        let names: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            if let Some(entry) = self.connections.remove(name.as_str()) {
                let conn = entry.val().clone();
                let io_loop = conn.get_loop().clone();
                io_loop.run_in_loop(move || conn.connect_destroyed());
            }
        }
    }
}
