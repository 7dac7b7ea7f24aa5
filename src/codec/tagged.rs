use std::{marker::PhantomData, sync::Arc};

use tracing::error;

use super::{decode_frames, seal_frame, verify_checksum, ErrorCode, Message, HEADER_LEN};
use crate::{buffer::Buffer, net::TcpConnectionPtr, timestamp::Timestamp};

pub type TaggedMessageCallback<M> = Arc<dyn Fn(&TcpConnectionPtr, M, Timestamp) + Send + Sync>;
/// Sees each whole frame, length header included. Returning `false` skips it.
pub type RawMessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &[u8], Timestamp) -> bool + Send + Sync>;
pub type TaggedErrorCallback =
    Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Timestamp, ErrorCode) + Send + Sync>;

/// Codec for a single message type identified by a fixed tag.
pub struct TaggedCodec<M: Message> {
    tag: &'static str,
    message_callback: TaggedMessageCallback<M>,
    raw_callback: Option<RawMessageCallback>,
    error_callback: TaggedErrorCallback,
    _message: PhantomData<fn() -> M>,
}

fn default_error_callback(conn: &TcpConnectionPtr, _buf: &mut Buffer, _t: Timestamp, code: ErrorCode) {
    error!("TaggedCodec::default_error_callback - {}", code.as_str());
    if conn.connected() {
        conn.shutdown();
    }
}

impl<M: Message> TaggedCodec<M> {
    pub fn new<F>(tag: &'static str, message_callback: F) -> Self
    where
        F: Fn(&TcpConnectionPtr, M, Timestamp) + Send + Sync + 'static,
    {
        Self {
            tag,
            message_callback: Arc::new(message_callback),
            raw_callback: None,
            error_callback: Arc::new(default_error_callback),
            _message: PhantomData,
        }
    }

    pub fn with_raw_callback<F>(mut self, raw_callback: F) -> Self
    where
        F: Fn(&TcpConnectionPtr, &[u8], Timestamp) -> bool + Send + Sync + 'static,
    {
        self.raw_callback = Some(Arc::new(raw_callback));
        self
    }

    pub fn with_error_callback<F>(mut self, error_callback: F) -> Self
    where
        F: Fn(&TcpConnectionPtr, &mut Buffer, Timestamp, ErrorCode) + Send + Sync + 'static,
    {
        self.error_callback = Arc::new(error_callback);
        self
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn min_message_len(&self) -> usize {
        self.tag.len() + HEADER_LEN
    }

    pub fn on_message(&self, conn: &TcpConnectionPtr, buf: &mut Buffer, receive_time: Timestamp) {
        let result = decode_frames(buf, self.min_message_len(), |data| {
            if let Some(raw) = &self.raw_callback {
                let mut frame = Vec::with_capacity(HEADER_LEN + data.len());
                frame.extend_from_slice(&(data.len() as i32).to_be_bytes());
                frame.extend_from_slice(data);
                if !raw(conn, &frame, receive_time) {
                    return Ok(());
                }
            }
            let message = self.parse(data)?;
            (self.message_callback)(conn, message, receive_time);
            Ok(())
        });
        if let Err(code) = result {
            (self.error_callback)(conn, buf, receive_time, code);
        }
    }

    pub fn send(&self, conn: &TcpConnectionPtr, message: &M) {
        let mut buf = Buffer::new();
        match self.fill_empty_buffer(&mut buf, message) {
            Ok(()) => conn.send_buffer(&mut buf),
            Err(e) => error!("TaggedCodec::send [{}] - {}", self.tag, e),
        }
    }

    pub fn fill_empty_buffer(&self, buf: &mut Buffer, message: &M) -> serde_json::Result<()> {
        assert_eq!(buf.readable_bytes(), 0);
        buf.append(self.tag.as_bytes());
        serde_json::to_writer(&mut *buf, message)?;
        seal_frame(buf);
        Ok(())
    }

    /// Validates one frame body (everything after the length header).
    pub fn parse(&self, data: &[u8]) -> Result<M, ErrorCode> {
        let body = verify_checksum(data)?;
        let payload = body
            .strip_prefix(self.tag.as_bytes())
            .ok_or(ErrorCode::UnknownMessageType)?;
        serde_json::from_slice(payload).map_err(|_| ErrorCode::ParseError)
    }
}
