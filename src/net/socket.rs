use std::{
    io,
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, FromRawFd, RawFd},
};

use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::error;

/// An owned, non-blocking TCP socket. Closes its descriptor on drop.
#[derive(Debug)]
pub struct Socket {
    inner: socket2::Socket,
}

fn to_socket_addr(addr: SockAddr) -> io::Result<SocketAddr> {
    addr.as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not an inet address"))
}

impl Socket {
    /// A fresh non-blocking, close-on-exec TCP socket for `addr`'s family.
    pub fn new_nonblocking(addr: &SocketAddr) -> io::Result<Self> {
        let inner = socket2::Socket::new(
            Domain::for_address(*addr),
            Type::STREAM.nonblocking().cloexec(),
            Some(Protocol::TCP),
        )?;
        Ok(Self { inner })
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.bind(&SockAddr::from(*addr))
    }

    pub fn listen(&self) -> io::Result<()> {
        self.inner.listen(libc::SOMAXCONN)
    }

    /// Accepts one pending connection, non-blocking and close-on-exec from
    /// the start.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let listen_fd = self.fd();
        // SAFETY: accept4 writes at most `*len` bytes into the storage
        // socket2 hands us, and a non-negative return is a fresh descriptor
        // that nothing else owns.
        let (inner, peer) = unsafe {
            SockAddr::try_init(|storage, len| {
                let fd = libc::accept4(
                    listen_fd,
                    storage.cast::<libc::sockaddr>(),
                    len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                );
                if fd < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(socket2::Socket::from_raw_fd(fd))
                }
            })?
        };
        Ok((Socket { inner }, to_socket_addr(peer)?))
    }

    /// Starts a non-blocking connect. `EINPROGRESS` comes back as an error.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        self.inner.connect(&SockAddr::from(*addr))
    }

    /// Writes without raising `SIGPIPE`.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.inner.send(data)
    }

    pub fn shutdown_write(&self) {
        if let Err(e) = self.inner.shutdown(Shutdown::Write) {
            error!("Socket::shutdown_write fd = {}: {}", self.fd(), e);
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(e) = self.inner.set_nodelay(on) {
            error!("TCP_NODELAY failed on fd = {}: {}", self.fd(), e);
        }
    }

    pub fn set_reuse_addr(&self, on: bool) {
        if let Err(e) = self.inner.set_reuse_address(on) {
            error!("SO_REUSEADDR failed on fd = {}: {}", self.fd(), e);
        }
    }

    pub fn set_reuse_port(&self, on: bool) {
        if let Err(e) = self.inner.set_reuse_port(on) {
            error!("SO_REUSEPORT failed on fd = {}: {}", self.fd(), e);
        }
    }

    pub fn set_keep_alive(&self, on: bool) {
        if let Err(e) = self.inner.set_keepalive(on) {
            error!("SO_KEEPALIVE failed on fd = {}: {}", self.fd(), e);
        }
    }

    /// Pending `SO_ERROR`, cleared by reading it.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        to_socket_addr(self.inner.local_addr()?)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        to_socket_addr(self.inner.peer_addr()?)
    }

    /// True when the socket ended up connected to itself.
    pub fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }

    fn tcp_info(&self) -> Option<libc::tcp_info> {
        // SAFETY: tcp_info is plain data; the kernel fills at most `len` bytes.
        unsafe {
            let mut info: libc::tcp_info = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
            let ret = libc::getsockopt(
                self.fd(),
                libc::SOL_TCP,
                libc::TCP_INFO,
                (&mut info as *mut libc::tcp_info).cast(),
                &mut len,
            );
            (ret == 0).then_some(info)
        }
    }

    /// Kernel `TCP_INFO` summary, or `None` if the query failed.
    pub fn tcp_info_string(&self) -> Option<String> {
        self.tcp_info().map(|info| {
            format!(
                "unrecovered={} rto={} ato={} snd_mss={} rcv_mss={} lost={} retrans={} rtt={} rttvar={} sshthresh={} cwnd={} total_retrans={}",
                info.tcpi_retransmits,
                info.tcpi_rto,
                info.tcpi_ato,
                info.tcpi_snd_mss,
                info.tcpi_rcv_mss,
                info.tcpi_lost,
                info.tcpi_retrans,
                info.tcpi_rtt,
                info.tcpi_rttvar,
                info.tcpi_snd_ssthresh,
                info.tcpi_snd_cwnd,
                info.tcpi_total_retrans,
            )
        })
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn listen_accept_write() {
        let listener = Socket::new_nonblocking(&loopback()).unwrap();
        listener.set_reuse_addr(true);
        listener.bind(&loopback()).unwrap();
        listener.listen().unwrap();
        let addr = listener.local_addr().unwrap();

        let would_block = listener.accept().unwrap_err();
        assert_eq!(would_block.kind(), io::ErrorKind::WouldBlock);

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (conn, peer) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => panic!("accept failed: {}", e),
            }
        };
        assert_eq!(peer, client.local_addr().unwrap());
        assert!(!conn.is_self_connect());
        // SAFETY: querying flags of a descriptor we own.
        let (status, fd_flags) = unsafe {
            (
                libc::fcntl(conn.fd(), libc::F_GETFL),
                libc::fcntl(conn.fd(), libc::F_GETFD),
            )
        };
        assert_ne!(status & libc::O_NONBLOCK, 0);
        assert_ne!(fd_flags & libc::FD_CLOEXEC, 0);
        assert!(conn.tcp_info_string().unwrap().contains("rto="));

        assert_eq!(conn.write(b"hello").unwrap(), 5);
        conn.shutdown_write();
        let mut received = String::new();
        client.read_to_string(&mut received).unwrap();
        assert_eq!(received, "hello");
    }

    #[test]
    fn nonblocking_connect_reports_in_progress_or_success() {
        let listener = std::net::TcpListener::bind(loopback()).unwrap();
        let addr = listener.local_addr().unwrap();
        let socket = Socket::new_nonblocking(&addr).unwrap();
        match socket.connect(&addr) {
            Ok(()) => {}
            Err(e) => assert_eq!(e.raw_os_error(), Some(libc::EINPROGRESS)),
        }
    }
}
