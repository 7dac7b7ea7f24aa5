use std::sync::Arc;

use tracing::error;

use super::{decode_frames, seal_frame, verify_checksum, ErrorCode, Message, HEADER_LEN};
use crate::{
    buffer::Buffer,
    net::TcpConnectionPtr,
    timestamp::Timestamp,
};

/// A checked frame borrowed from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub type_name: &'a str,
    pub payload: &'a [u8],
}

impl Frame<'_> {
    /// Decodes the payload as `M`, requiring the type names to match.
    pub fn decode<M: Message>(&self) -> Result<M, ErrorCode> {
        if self.type_name != M::TYPE_NAME {
            return Err(ErrorCode::UnknownMessageType);
        }
        serde_json::from_slice(self.payload).map_err(|_| ErrorCode::ParseError)
    }
}

/// Receives each well-formed frame; an `Err` is reported like a framing error.
pub type FrameCallback =
    Arc<dyn Fn(&TcpConnectionPtr, Frame<'_>, Timestamp) -> Result<(), ErrorCode> + Send + Sync>;
pub type ErrorCallback =
    Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp, ErrorCode) + Send + Sync>;

/// Codec whose frames carry the message type name.
pub struct TypedCodec {
    frame_callback: FrameCallback,
    error_callback: ErrorCallback,
}

fn default_error_callback(conn: &TcpConnectionPtr, _buf: &mut Buffer, _t: Timestamp, code: ErrorCode) {
    error!("TypedCodec::default_error_callback - {}", code.as_str());
    if conn.connected() {
        conn.shutdown();
    }
}

impl TypedCodec {
    /// nameLen + "X\0" + checksum.
    pub const MIN_MESSAGE_LEN: usize = 2 * HEADER_LEN + 2;

    pub fn new<F>(frame_callback: F) -> Self
    where
        F: Fn(&TcpConnectionPtr, Frame<'_>, Timestamp) -> Result<(), ErrorCode> + Send + Sync + 'static,
    {
        Self {
            frame_callback: Arc::new(frame_callback),
            error_callback: Arc::new(default_error_callback),
        }
    }

    pub fn with_error_callback<F>(mut self, error_callback: F) -> Self
    where
        F: Fn(&TcpConnectionPtr, &mut Buffer, Timestamp, ErrorCode) + Send + Sync + 'static,
    {
        self.error_callback = Arc::new(error_callback);
        self
    }

    /// Message callback for a connection carrying typed frames.
    pub fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, receive_time: Timestamp) {
        let result = decode_frames(buf, Self::MIN_MESSAGE_LEN, |data| {
            let frame = Self::parse_frame(data)?;
            (self.frame_callback)(conn, frame, receive_time)
        });
        if let Err(code) = result {
            (self.error_callback)(conn, buf, receive_time, code);
        }
    }

    pub fn send<M: Message>(conn: &TcpConnectionPtr, message: &M) {
        let mut buf = Buffer::new();
        match Self::fill_empty_buffer(&mut buf, message) {
            Ok(()) => conn.send_buffer(&mut buf),
            Err(e) => error!("TypedCodec::send {} - {}", M::TYPE_NAME, e),
        }
    }

    /// Encodes one complete frame, length header included, into an empty buffer.
    pub fn fill_empty_buffer<M: Message>(buf: &mut Buffer, message: &M) -> serde_json::Result<()> {
        assert_eq!(buf.readable_bytes(), 0);
        let name = M::TYPE_NAME.as_bytes();
        buf.append_i32(name.len() as i32 + 1);
        buf.append(name);
        buf.append(&[0]);
        serde_json::to_writer(&mut *buf, message)?;
        seal_frame(buf);
        Ok(())
    }

    /// Validates one frame body (everything after the length header).
    ///
    /// The checksum is checked first, then the name length
    /// (`2 <= nameLen <= len - 8`, counting the NUL).
    pub fn parse_frame(data: &[u8]) -> Result<Frame<'_>, ErrorCode> {
        let len = data.len();
        let body = verify_checksum(data)?;
        if body.len() < HEADER_LEN {
            return Err(ErrorCode::InvalidNameLen);
        }
        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&body[..HEADER_LEN]);
        let name_len = i32::from_be_bytes(raw);
        if name_len < 2 || name_len as usize > len - 2 * HEADER_LEN {
            return Err(ErrorCode::InvalidNameLen);
        }
        let name_len = name_len as usize;
        let name = &body[HEADER_LEN..HEADER_LEN + name_len - 1];
        let type_name = std::str::from_utf8(name).map_err(|_| ErrorCode::UnknownMessageType)?;
        Ok(Frame {
            type_name,
            payload: &body[HEADER_LEN + name_len..],
        })
    }

    /// Parses one frame body straight into `M`.
    pub fn decode<M: Message>(data: &[u8]) -> Result<M, ErrorCode> {
        Self::parse_frame(data)?.decode()
    }
}
