//! Growable byte queue used for connection input/output and frame encoding.
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! |                   |     (CONTENT)    |                  |
//! +-------------------+------------------+------------------+
//! |                   |                  |                  |
//! 0      <=        reader      <=      writer      <=     len
//! ```

use std::{io, os::fd::RawFd};

const CRLF: &[u8] = b"\r\n";
const EXTRA_BUF_SIZE: usize = 65536;

#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! int_accessors {
    ($ty:ty, $append:ident, $peek:ident, $read:ident, $prepend:ident) => {
        /// Appends the value in network byte order.
        pub fn $append(&mut self, value: $ty) {
            self.append(&value.to_be_bytes());
        }

        /// Peeks a network-order value. Panics if not enough bytes are readable.
        pub fn $peek(&self) -> $ty {
            const N: usize = std::mem::size_of::<$ty>();
            assert!(self.readable_bytes() >= N, "peek past readable bytes");
            let mut raw = [0u8; N];
            raw.copy_from_slice(&self.peek()[..N]);
            <$ty>::from_be_bytes(raw)
        }

        pub fn $read(&mut self) -> $ty {
            let value = self.$peek();
            self.retrieve(std::mem::size_of::<$ty>());
            value
        }

        pub fn $prepend(&mut self, value: $ty) {
            self.prepend(&value.to_be_bytes());
        }
    };
}

impl Buffer {
    pub const CHEAP_PREPEND: usize = 8;
    pub const INITIAL_SIZE: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::INITIAL_SIZE)
    }

    pub fn with_capacity(initial_size: usize) -> Self {
        Self {
            buf: vec![0; Self::CHEAP_PREPEND + initial_size],
            reader: Self::CHEAP_PREPEND,
            writer: Self::CHEAP_PREPEND,
        }
    }

    pub fn swap(&mut self, other: &mut Buffer) {
        std::mem::swap(self, other);
    }

    pub fn readable_bytes(&self) -> usize {
        self.writer - self.reader
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer
    }

    pub fn prependable_bytes(&self) -> usize {
        self.reader
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader..self.writer]
    }

    /// Offset of the first `\r\n` in the readable region.
    pub fn find_crlf(&self) -> Option<usize> {
        self.find_crlf_from(0)
    }

    pub fn find_crlf_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .windows(CRLF.len())
            .position(|w| w == CRLF)
            .map(|pos| start + pos)
    }

    /// Offset of the first `\n` in the readable region.
    pub fn find_eol(&self) -> Option<usize> {
        self.find_eol_from(0)
    }

    pub fn find_eol_from(&self, start: usize) -> Option<usize> {
        assert!(start <= self.readable_bytes());
        self.peek()[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| start + pos)
    }

    pub fn retrieve(&mut self, len: usize) {
        assert!(
            len <= self.readable_bytes(),
            "retrieve {} bytes with only {} readable",
            len,
            self.readable_bytes()
        );
        if len < self.readable_bytes() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Retrieves everything before `offset` (relative to [`peek`](Self::peek)).
    pub fn retrieve_until(&mut self, offset: usize) {
        self.retrieve(offset);
    }

    pub fn retrieve_all(&mut self) {
        self.reader = Self::CHEAP_PREPEND;
        self.writer = Self::CHEAP_PREPEND;
    }

    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let bytes = self.peek()[..len].to_vec();
        self.retrieve(len);
        bytes
    }

    /// Retrieves `len` bytes as a string, replacing invalid UTF-8.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        assert!(len <= self.readable_bytes());
        let s = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        s
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.peek()).into_owned()
    }

    /// The writable tail.
    pub fn begin_write(&mut self) -> &mut [u8] {
        let writer = self.writer;
        &mut self.buf[writer..]
    }

    pub fn has_written(&mut self, len: usize) {
        assert!(len <= self.writable_bytes());
        self.writer += len;
    }

    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.writer -= len;
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let writer = self.writer;
        self.buf[writer..writer + data.len()].copy_from_slice(data);
        self.has_written(data.len());
    }

    /// Writes `data` in front of the readable region.
    ///
    /// The caller guarantees `prependable_bytes() >= data.len()`; the buffer
    /// never grows to make room at the front.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend {} bytes with only {} prependable",
            data.len(),
            self.prependable_bytes()
        );
        self.reader -= data.len();
        let reader = self.reader;
        self.buf[reader..reader + data.len()].copy_from_slice(data);
    }

    int_accessors!(i64, append_i64, peek_i64, read_i64, prepend_i64);
    int_accessors!(i32, append_i32, peek_i32, read_i32, prepend_i32);
    int_accessors!(i16, append_i16, peek_i16, read_i16, prepend_i16);
    int_accessors!(i8, append_i8, peek_i8, read_i8, prepend_i8);

    /// Reallocates so only the readable bytes plus `reserve` remain.
    pub fn shrink(&mut self, reserve: usize) {
        let mut other = Buffer::with_capacity(self.readable_bytes() + reserve);
        other.append(self.peek());
        self.swap(&mut other);
    }

    pub fn internal_capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Reads from `fd` with a single `readv`, spilling into a stack buffer
    /// when the writable tail is too small.
    ///
    /// Returns `Ok(0)` on end of file.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let writer = self.writer;
        let iov = [
            libc::iovec {
                iov_base: self.buf[writer..].as_mut_ptr().cast(),
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr().cast(),
                iov_len: extra.len(),
            },
        ];
        // With a tail already larger than the stack buffer one vector suffices.
        let iovcnt = if writable < extra.len() { 2 } else { 1 };
        // SAFETY: both iovecs point into live, exclusively borrowed memory of
        // the stated lengths.
        let n = unsafe { libc::readv(fd, iov.as_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.writer += n;
        } else {
            self.writer = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + Self::CHEAP_PREPEND {
            self.buf.resize(self.writer + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader..self.writer, Self::CHEAP_PREPEND);
            self.reader = Self::CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }
}

impl io::Write for Buffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.append(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn append_retrieve() {
        let mut buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);

        let s = "x".repeat(200);
        buf.append(s.as_bytes());
        assert_eq!(buf.readable_bytes(), 200);
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE - 200);

        let head = buf.retrieve_as_string(50);
        assert_eq!(head.len(), 50);
        assert_eq!(buf.readable_bytes(), 150);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND + 50);

        buf.append(s.as_bytes());
        assert_eq!(buf.readable_bytes(), 350);

        let rest = buf.retrieve_all_as_string();
        assert_eq!(rest.len(), 350);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
    }

    #[test]
    fn grows_when_needed() {
        let mut buf = Buffer::new();
        buf.append("y".repeat(400).as_bytes());
        buf.retrieve(50);
        buf.append("z".repeat(1000).as_bytes());
        assert_eq!(buf.readable_bytes(), 1350);
        assert_eq!(buf.writable_bytes(), 0);
        assert_eq!(&buf.peek()[..350], "y".repeat(350).as_bytes());
        assert_eq!(&buf.peek()[350..], "z".repeat(1000).as_bytes());

        buf.retrieve_all();
        assert_eq!(buf.readable_bytes(), 0);
        assert!(buf.writable_bytes() >= Buffer::INITIAL_SIZE);
    }

    #[test]
    fn compacts_inside() {
        let mut buf = Buffer::new();
        buf.append("y".repeat(800).as_bytes());
        buf.retrieve(500);
        assert_eq!(buf.writable_bytes(), 224);

        buf.append("z".repeat(300).as_bytes());
        assert_eq!(buf.readable_bytes(), 600);
        assert_eq!(buf.writable_bytes(), Buffer::INITIAL_SIZE - 600);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND);
        assert_eq!(&buf.peek()[..300], "y".repeat(300).as_bytes());
    }

    #[test]
    fn shrink_keeps_content() {
        let mut buf = Buffer::new();
        buf.append("y".repeat(2000).as_bytes());
        buf.retrieve(1500);
        buf.shrink(0);
        assert_eq!(buf.readable_bytes(), 500);
        assert_eq!(buf.writable_bytes(), 0);
        assert_eq!(buf.peek(), "y".repeat(500).as_bytes());
    }

    #[test]
    fn prepend_uses_cheap_space() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        buf.prepend_i32(7);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.prependable_bytes(), Buffer::CHEAP_PREPEND - 4);
        assert_eq!(buf.read_i32(), 7);
        assert_eq!(buf.retrieve_all_as_string(), "payload");
    }

    #[test]
    #[should_panic]
    fn prepend_past_margin_panics() {
        let mut buf = Buffer::new();
        buf.prepend(&[0u8; Buffer::CHEAP_PREPEND + 1]);
    }

    #[test]
    #[should_panic]
    fn over_retrieve_panics() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.retrieve(4);
    }

    #[test]
    fn finders() {
        let mut buf = Buffer::new();
        buf.append(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(buf.find_crlf(), Some(14));
        assert_eq!(buf.find_crlf_from(16), Some(23));
        assert_eq!(buf.find_eol(), Some(15));
        assert_eq!(buf.find_eol_from(16), Some(24));

        let mut plain = Buffer::new();
        plain.append(b"no terminator");
        assert_eq!(plain.find_crlf(), None);
        assert_eq!(plain.find_eol(), None);
    }

    #[test]
    fn network_byte_order() {
        let mut buf = Buffer::new();
        buf.append_i32(0x0102_0304);
        assert_eq!(buf.peek(), &[1, 2, 3, 4]);
        buf.append_i16(-2);
        assert_eq!(&buf.peek()[4..], &[0xff, 0xfe]);
    }

    #[test]
    fn read_fd_spills_into_extra_buffer() {
        let (mut tx, rx) = std::os::unix::net::UnixStream::pair().unwrap();
        let payload = vec![0xabu8; 4000];
        std::io::Write::write_all(&mut tx, &payload).unwrap();

        let mut buf = Buffer::with_capacity(16);
        let n = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, 4000);
        assert_eq!(buf.peek(), payload.as_slice());

        drop(tx);
        assert_eq!(buf.read_fd(rx.as_raw_fd()).unwrap(), 0);
    }

    #[derive(Debug, Clone)]
    enum Int {
        I8(i8),
        I16(i16),
        I32(i32),
        I64(i64),
    }

    fn any_int() -> impl Strategy<Value = Int> {
        prop_oneof![
            any::<i8>().prop_map(Int::I8),
            any::<i16>().prop_map(Int::I16),
            any::<i32>().prop_map(Int::I32),
            any::<i64>().prop_map(Int::I64),
        ]
    }

    proptest! {
        #[test]
        fn integers_round_trip(values in proptest::collection::vec(any_int(), 1..64)) {
            let mut buf = Buffer::with_capacity(8);
            for v in &values {
                match *v {
                    Int::I8(x) => buf.append_i8(x),
                    Int::I16(x) => buf.append_i16(x),
                    Int::I32(x) => buf.append_i32(x),
                    Int::I64(x) => buf.append_i64(x),
                }
            }
            for v in &values {
                let before = buf.readable_bytes();
                match *v {
                    Int::I8(x) => { prop_assert_eq!(buf.read_i8(), x); prop_assert_eq!(before - buf.readable_bytes(), 1); }
                    Int::I16(x) => { prop_assert_eq!(buf.read_i16(), x); prop_assert_eq!(before - buf.readable_bytes(), 2); }
                    Int::I32(x) => { prop_assert_eq!(buf.read_i32(), x); prop_assert_eq!(before - buf.readable_bytes(), 4); }
                    Int::I64(x) => { prop_assert_eq!(buf.read_i64(), x); prop_assert_eq!(before - buf.readable_bytes(), 8); }
                }
            }
            prop_assert_eq!(buf.readable_bytes(), 0);
        }

        #[test]
        fn appends_never_lose_bytes(chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..700), 1..20),
                                    consume in proptest::collection::vec(0usize..500, 1..20)) {
            let mut buf = Buffer::new();
            let mut model: Vec<u8> = Vec::new();
            for (i, chunk) in chunks.iter().enumerate() {
                buf.append(chunk);
                model.extend_from_slice(chunk);
                let take = consume[i % consume.len()].min(model.len());
                buf.retrieve(take);
                model.drain(..take);
                prop_assert_eq!(buf.peek(), model.as_slice());
            }
            buf.retrieve_all();
            prop_assert_eq!(buf.readable_bytes(), 0);
            prop_assert!(buf.writable_bytes() >= Buffer::INITIAL_SIZE);
        }
    }
}
