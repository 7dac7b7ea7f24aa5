//! TCP plumbing on top of [`EventLoop`](crate::EventLoop).
//!
//! ```text
//!  TcpServer ── Acceptor ──(socket)──▶ TcpConnection ◀──(socket)── Connector ── TcpClient
//!      │                                  │    │
//!      └─ EventLoopThreadPool ──(io loop)─┘    └─ Channel ─▶ Poller
//! ```
//!
//! A [`TcpConnection`] lives on exactly one loop. Its callbacks always run on
//! that loop's thread; `send`, `shutdown` and `force_close` may be called from
//! anywhere.

mod acceptor;
mod connector;
mod socket;
mod tcp_client;
mod tcp_connection;
mod tcp_server;

use std::sync::Arc;

use tracing::trace;

pub use acceptor::Acceptor;
pub use connector::{Connector, ConnectorState};
pub use socket::Socket;
pub use tcp_client::TcpClient;
pub use tcp_connection::{ConnectionState, TcpConnection, DEFAULT_HIGH_WATER_MARK};
pub use tcp_server::TcpServer;

use crate::{buffer::Buffer, timestamp::Timestamp};

pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Fired on connect and again on disconnect; check `connected()`.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Receives the output length that crossed the mark.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
/// Receives the connection's input buffer and the poll return time.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp) + Send + Sync>;

pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    trace!(
        "{} -> {} is {}",
        conn.local_address(),
        conn.peer_address(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Discards whatever arrived.
pub fn default_message_callback(_conn: &TcpConnectionPtr, buf: &mut Buffer, _receive_time: Timestamp) {
    buf.retrieve_all();
}
