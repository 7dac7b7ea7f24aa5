mod common;

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use mill_reactor::{net::ConnectionState, poller::PollerKind, EventLoop, TcpServer};
use parking_lot::Mutex;

/// Connects one blocking client, reads until the server closes, then quits the loop.
fn drain_until_closed(event_loop: &Arc<EventLoop>, server: &TcpServer) -> thread::JoinHandle<Vec<u8>> {
    let addr = server.listen_addr().unwrap();
    let remote = event_loop.clone();
    thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut received = Vec::new();
        match stream.read_to_end(&mut received) {
            Ok(_) => {}
            // A close that races unread data turns into a reset; what arrived still counts.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            Err(e) => panic!("reading from the server failed: {}", e),
        }
        thread::sleep(Duration::from_millis(50));
        remote.quit();
        received
    })
}

fn send_after_shutdown_is_dropped(kind: PollerKind) {
    common::init_tracing();
    let event_loop = common::event_loop_on(kind);
    let server =
        TcpServer::new(&event_loop, common::server_config_on("Shutdown", kind, 0)).unwrap();
    let states = Arc::new(Mutex::new(Vec::new()));
    let seen = states.clone();
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            conn.send(b"before");
            conn.shutdown();
            seen.lock().push(conn.state());
            conn.send(b"after");
            conn.shutdown();
        }
    });
    server.start().unwrap();
    common::quit_after(&event_loop, Duration::from_secs(10));

    let client = drain_until_closed(&event_loop, &server);
    event_loop.run();

    assert_eq!(client.join().unwrap(), b"before");
    assert_eq!(*states.lock(), vec![ConnectionState::Disconnecting]);
}

fn force_close_fires_one_close(kind: PollerKind) {
    common::init_tracing();
    let event_loop = common::event_loop_on(kind);
    let server =
        TcpServer::new(&event_loop, common::server_config_on("ForceClose", kind, 0)).unwrap();
    let downs = Arc::new(Mutex::new(Vec::new()));
    let d = downs.clone();
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            conn.force_close();
            conn.force_close();
        } else {
            conn.send(b"ignored");
            d.lock().push((conn.state(), conn.pending_output_bytes()));
        }
    });
    server.start().unwrap();
    common::quit_after(&event_loop, Duration::from_secs(10));

    let client = drain_until_closed(&event_loop, &server);
    event_loop.run();

    assert!(client.join().unwrap().is_empty());
    assert_eq!(*downs.lock(), vec![(ConnectionState::Disconnected, 0)]);
    assert_eq!(server.connection_count(), 0);
}

/// The peer writes, then closes; the server reads everything and sees one DOWN.
fn peer_close_is_seen_once(kind: PollerKind) {
    common::init_tracing();
    let event_loop = common::event_loop_on(kind);
    let server =
        TcpServer::new(&event_loop, common::server_config_on("PeerClose", kind, 1)).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let downs = Arc::new(AtomicUsize::new(0));
    let (r, d) = (received.clone(), downs.clone());
    server.set_message_callback(move |_conn, buf, _| {
        let len = buf.readable_bytes();
        r.lock().extend_from_slice(&buf.retrieve_as_bytes(len));
    });
    server.set_connection_callback(move |conn| {
        if !conn.connected() {
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
        if closed.load(Ordering::SeqCst) == 1 && watched.connection_count() == 0 {
            if let Some(event_loop) = weak_loop.upgrade() {
                event_loop.quit();
            }
        }
    });

    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"goodbye").unwrap();
    });
    event_loop.run();
    client.join().unwrap();

    assert_eq!(*received.lock(), b"goodbye");
    assert_eq!(downs.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 0);
}

#[test]
fn send_after_shutdown_epoll() {
    send_after_shutdown_is_dropped(PollerKind::Epoll);
}

#[test]
fn send_after_shutdown_poll() {
    send_after_shutdown_is_dropped(PollerKind::Poll);
}

#[test]
fn force_close_epoll() {
    force_close_fires_one_close(PollerKind::Epoll);
}

#[test]
fn force_close_poll() {
    force_close_fires_one_close(PollerKind::Poll);
}

#[test]
fn peer_close_epoll() {
    peer_close_is_seen_once(PollerKind::Epoll);
}

#[test]
fn peer_close_poll() {
    peer_close_is_seen_once(PollerKind::Poll);
}

#[test]
fn high_water_mark_then_write_complete() {
    common::init_tracing();
    const PAYLOAD: usize = 32 * 1024 * 1024;
    const MARK: usize = 64 * 1024;
    let event_loop = EventLoop::new().unwrap();
    let server = TcpServer::new(&event_loop, common::server_config("Flood")).unwrap();

    let marks = Arc::new(Mutex::new(Vec::new()));
    let completes = Arc::new(AtomicUsize::new(0));
    let (m, c) = (marks.clone(), completes.clone());
    server.set_connection_callback(move |conn| {
        if !conn.connected() {
            return;
        }
        let m = m.clone();
        conn.set_high_water_mark_callback(Arc::new(move |_, queued| m.lock().push(queued)), MARK);
        conn.send(&vec![b'x'; PAYLOAD]);
    });
    server.set_write_complete_callback(move |conn| {
        c.fetch_add(1, Ordering::SeqCst);
        conn.shutdown();
    });
    server.start().unwrap();
    let addr = server.listen_addr().unwrap();
    common::quit_after(&event_loop, Duration::from_secs(20));

    let remote = event_loop.clone();
    let client = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(200));
        let mut total = 0;
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => total += n,
            }
        }
        remote.quit();
        total
    });

    event_loop.run();
    assert_eq!(client.join().unwrap(), PAYLOAD);
    assert_eq!(completes.load(Ordering::SeqCst), 1);
    let marks = marks.lock();
    assert_eq!(marks.len(), 1);
    assert!(marks[0] >= MARK && marks[0] <= PAYLOAD);
}
