use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use super::{
    connector::Connector, default_connection_callback, default_message_callback, socket::Socket,
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
};
use crate::{buffer::Buffer, event_loop::EventLoop, timestamp::Timestamp};

#[derive(Clone)]
struct ClientCallbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
}

/// Holds at most one connection to a server, optionally reconnecting after
/// it drops.
pub struct TcpClient {
    event_loop: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,
    callbacks: Mutex<ClientCallbacks>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConnectionPtr>>,
    weak_self: Weak<TcpClient>,
}

impl TcpClient {
    pub fn new(event_loop: &Arc<EventLoop>, server_addr: SocketAddr, name: impl Into<String>) -> Arc<Self> {
        let connector = Connector::new(event_loop, server_addr);
        let client = Arc::new_cyclic(|weak: &Weak<TcpClient>| TcpClient {
            event_loop: event_loop.clone(),
            connector: connector.clone(),
            name: name.into(),
            callbacks: Mutex::new(ClientCallbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
            }),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            weak_self: weak.clone(),
        });
        let weak = Arc::downgrade(&client);
        connector.set_new_connection_callback(move |socket| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(socket);
            }
        });
        info!(
            "TcpClient::new[{}] - connector {:p}",
            client.name,
            Arc::as_ptr(&connector)
        );
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.connection.lock().clone()
    }

    pub fn retry(&self) -> bool {
        self.retry.load(Ordering::Acquire)
    }

    /// Reconnect after an established connection drops.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
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

    pub fn connect(&self) {
        info!(
            "TcpClient::connect[{}] - connecting to {}",
            self.name,
            self.connector.server_address()
        );
        self.connect.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Half-closes the current connection.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection() {
            conn.shutdown();
        }
    }

    /// Abandons a connect attempt in flight.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    fn new_connection(&self, socket: Socket) {
        self.event_loop.assert_in_loop_thread();
        let (peer_addr, local_addr) = match (socket.peer_addr(), socket.local_addr()) {
            (Ok(peer), Ok(local)) => (peer, local),
            (Err(e), _) | (_, Err(e)) => {
                error!("TcpClient::new_connection[{}] - {}", self.name, e);
                return;
            }
        };
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, id);

        let conn = TcpConnection::new(self.event_loop.clone(), conn_name, socket, local_addr, peer_addr);
        let callbacks = self.callbacks.lock().clone();
        conn.set_connection_callback(callbacks.connection);
        conn.set_message_callback(callbacks.message);
        if let Some(cb) = callbacks.write_complete {
            conn.set_write_complete_callback(cb);
        }
        let weak = self.weak_self.clone();
        conn.set_close_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            match weak.upgrade() {
                Some(client) => client.remove_connection(conn),
                None => {
                    let conn = conn.clone();
                    let io_loop = conn.get_loop().clone();
                    io_loop.queue_in_loop(move || conn.connect_destroyed());
                }
            }
        }));
        *self.connection.lock() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        self.event_loop.assert_in_loop_thread();
        {
            let mut current = self.connection.lock();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                *current = None;
            }
        }
        let destroyed = conn.clone();
        self.event_loop.queue_in_loop(move || destroyed.connect_destroyed());
        if self.retry() && self.connect.load(Ordering::Acquire) {
            info!(
                "TcpClient::remove_connection[{}] - Reconnecting to {}",
                self.name,
                self.connector.server_address()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        debug!("TcpClient::drop[{}]", self.name);
        if let Some(conn) = self.connection.lock().take() {
            conn.force_close();
        }
        self.connector.stop();
    }
}
