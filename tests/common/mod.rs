#![allow(dead_code)]

use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
    time::Duration,
};

use mill_reactor::{poller::PollerKind, EventLoop, EventLoopConfig, TcpServerConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Quits `event_loop` after `timeout` so a broken test fails instead of hanging.
pub fn quit_after(event_loop: &Arc<EventLoop>, timeout: Duration) {
    let weak = Arc::downgrade(event_loop);
    event_loop.run_after(timeout, move || {
        if let Some(event_loop) = weak.upgrade() {
            event_loop.quit();
        }
    });
}

pub fn server_config(name: &str) -> TcpServerConfig {
    TcpServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .name(name)
        .build()
}

pub fn loop_config(kind: PollerKind) -> EventLoopConfig {
    EventLoopConfig::builder().poller(kind).build()
}

/// A loop on the current thread backed by `kind`.
pub fn event_loop_on(kind: PollerKind) -> Arc<EventLoop> {
    EventLoop::with_config(loop_config(kind)).unwrap()
}

/// Like [`server_config`], with the I/O loops backed by `kind` as well.
pub fn server_config_on(name: &str, kind: PollerKind, num_threads: usize) -> TcpServerConfig {
    TcpServerConfig::builder()
        .address("127.0.0.1:0".parse().unwrap())
        .name(name)
        .num_threads(num_threads)
        .loop_config(loop_config(kind))
        .build()
}

/// An address nothing listens on, for now.
pub fn vacant_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}
