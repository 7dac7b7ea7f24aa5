//! # Mill-Reactor
//! A reactor-per-thread networking toolkit: one [`EventLoop`] per thread, non-blocking TCP
//! servers and clients on top, and a checksummed length-prefixed message codec.
//!
//! Every loop owns a poller (epoll or poll), a timer queue driven by a `timerfd`, and an
//! `eventfd` used to wake it when another thread queues work. Connections are pinned to
//! one loop; their callbacks always run on that loop's thread.
//! ## Features
//! - **One loop per thread**: cross-thread work goes through [`EventLoop::run_in_loop`]
//! - **Timers**: [`EventLoop::run_at`], [`EventLoop::run_after`], [`EventLoop::run_every`] with cancellation
//! - **TCP**: [`TcpServer`] spreads accepted connections across an [`EventLoopThreadPool`]; [`TcpClient`] reconnects with backoff
//! - **Buffers**: [`Buffer`] with a cheap prepend area for length headers
//! - **Codec**: typed and tagged frames carrying JSON payloads, guarded by Adler-32
//! - **RPC**: request/response services over the tagged codec
//! ## Architecture Overview
//! ```text
//! ┌─────────────┐    ┌──────────────┐    ┌─────────────┐
//! │ EventLoop   │───▶│   Poller     │───▶│  Channels   │
//! └─────────────┘    └──────────────┘    └─────────────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌──────────────┐                      ┌──────────────┐
//! │  TimerQueue  │                      │ TcpConnection│
//! └──────────────┘                      └──────────────┘
//! ```
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_reactor::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let event_loop = EventLoop::new()?;
//!     let config = TcpServerConfig::builder()
//!         .address("127.0.0.1:9981".parse()?)
//!         .name("EchoServer")
//!         .build();
//!     let server = TcpServer::new(&event_loop, config)?;
//!     server.set_message_callback(|conn, buf, _receive_time| {
//!         let data = buf.retrieve_all_as_string();
//!         conn.send(data.as_bytes());
//!     });
//!     server.start()?;
//!     event_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! - [`event_loop`]: the loop itself, its task queue and timers
//! - [`net`]: acceptor, connector, connections, server and client
//! - [`codec`]: framing and message dispatch
//! - [`rpc`]: services and channels over the codec
//! - [`error`]: error types and result handling

pub mod buffer;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod event_loop_thread;
pub mod net;
pub mod poller;
pub mod rpc;
pub mod timer;
pub mod timer_queue;
pub mod timestamp;

pub use buffer::Buffer;
pub use config::{EventLoopConfig, TcpServerConfig};
pub use error::{Error, Result};
pub use event_loop::EventLoop;
pub use event_loop_thread::{EventLoopThread, EventLoopThreadPool};
pub use net::{TcpClient, TcpConnection, TcpConnectionPtr, TcpServer};
pub use timer::TimerId;
pub use timestamp::Timestamp;

/// A convenient prelude module that re-exports commonly used types and traits.
///
/// ```rust
/// use mill_reactor::prelude::*;
/// ```
pub mod prelude {
    pub use crate::buffer::Buffer;
    pub use crate::codec::{Dispatcher, Frame, Message, TaggedCodec, TypedCodec};
    pub use crate::config::{EventLoopConfig, TcpServerConfig};
    pub use crate::event_loop::EventLoop;
    pub use crate::event_loop_thread::{EventLoopThread, EventLoopThreadPool};
    pub use crate::net::{TcpClient, TcpConnection, TcpConnectionPtr, TcpServer};
    pub use crate::rpc::{RpcChannel, RpcServer, Service};
    pub use crate::timer::TimerId;
    pub use crate::timestamp::Timestamp;
}
