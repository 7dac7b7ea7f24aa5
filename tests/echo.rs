mod common;

use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use mill_reactor::{poller::PollerKind, EventLoop, TcpServer, TcpServerConfig};

fn echo_server(event_loop: &Arc<EventLoop>, config: TcpServerConfig) -> Arc<TcpServer> {
    let server = TcpServer::new(event_loop, config).unwrap();
    server.set_message_callback(|conn, buf, _| {
        let len = buf.readable_bytes();
        let data = buf.retrieve_as_bytes(len);
        conn.send(&data);
    });
    server
}

fn echoes_on_the_accepting_loop(kind: PollerKind) {
    common::init_tracing();
    let event_loop = common::event_loop_on(kind);
    let server = echo_server(&event_loop, common::server_config_on("EchoServer", kind, 0));
    server.start().unwrap();
    let addr = server.listen_addr().unwrap();
    common::quit_after(&event_loop, Duration::from_secs(10));

    let remote = event_loop.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello, reactor").unwrap();
        let mut reply = [0u8; 14];
        stream.read_exact(&mut reply).unwrap();
        remote.quit();
        reply
    });

    event_loop.run();
    assert_eq!(&client.join().unwrap(), b"hello, reactor");
}

fn echoes_across_io_threads_and_forgets_closed_connections(kind: PollerKind) {
    common::init_tracing();
    const CLIENTS: usize = 4;
    let event_loop = common::event_loop_on(kind);
    let config = TcpServerConfig {
        no_delay: true,
        ..common::server_config_on("PoolEcho", kind, 2)
    };
    let server = echo_server(&event_loop, config);

    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    let (u, d) = (ups.clone(), downs.clone());
    server.set_connection_callback(move |conn| {
        assert!(conn.get_loop().is_in_loop_thread());
        if conn.connected() {
            u.fetch_add(1, Ordering::SeqCst);
        } else {
            d.fetch_add(1, Ordering::SeqCst);
        }
    });
    server.start().unwrap();
    let addr = server.listen_addr().unwrap();
    common::quit_after(&event_loop, Duration::from_secs(10));

    let watched = server.clone();
    let closed = downs.clone();
    let weak_loop = Arc::downgrade(&event_loop);
    event_loop.run_every(Duration::from_millis(10), move || {
        if closed.load(Ordering::SeqCst) == CLIENTS && watched.connection_count() == 0 {
            if let Some(event_loop) = weak_loop.upgrade() {
                event_loop.quit();
            }
        }
    });

    let clients: Vec<_> = (0..CLIENTS)
        .map(|i| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                let message = format!("client {} says hi", i).into_bytes();
                for _ in 0..10 {
                    stream.write_all(&message).unwrap();
                    let mut reply = vec![0u8; message.len()];
                    stream.read_exact(&mut reply).unwrap();
                    assert_eq!(reply, message);
                }
            })
        })
        .collect();

    event_loop.run();
    for client in clients {
        client.join().unwrap();
    }
    assert_eq!(ups.load(Ordering::SeqCst), CLIENTS);
    assert_eq!(downs.load(Ordering::SeqCst), CLIENTS);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn echo_single_loop_epoll() {
    echoes_on_the_accepting_loop(PollerKind::Epoll);
}

#[test]
fn echo_single_loop_poll() {
    echoes_on_the_accepting_loop(PollerKind::Poll);
}

#[test]
fn echo_io_threads_epoll() {
    echoes_across_io_threads_and_forgets_closed_connections(PollerKind::Epoll);
}

#[test]
fn echo_io_threads_poll() {
    echoes_across_io_threads_and_forgets_closed_connections(PollerKind::Poll);
}
