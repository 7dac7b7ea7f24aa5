//! Length-prefixed, Adler-32 checksummed message framing.
//!
//! Every frame starts with a 4-byte big-endian length that counts the rest
//! of the frame and ends with the Adler-32 of everything between the length
//! and the checksum:
//!
//! ```text
//! typed:   | len | nameLen | name\0 | payload | adler32 |
//! tagged:  | len | tag     | payload           | adler32 |
//! ```
//!
//! Payloads are JSON documents produced by `serde_json`.

mod dispatcher;
mod tagged;
mod typed;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub use dispatcher::{DefaultCallback, Dispatcher};
pub use tagged::{RawMessageCallback, TaggedCodec, TaggedMessageCallback};
pub use typed::{Frame, FrameCallback, TypedCodec};

use crate::buffer::Buffer;

pub const HEADER_LEN: usize = std::mem::size_of::<i32>();
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

const MOD_ADLER: u32 = 65521;
// Largest n such that 255n(n+1)/2 + (n+1)(MOD_ADLER-1) fits in 32 bits.
const NMAX: usize = 5552;

/// A value that can travel inside a frame.
///
/// `TYPE_NAME` is written on the wire by [`TypedCodec`] and selects the
/// [`Dispatcher`] route on the receiving side.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ErrorCode {
    #[error("InvalidLength")]
    InvalidLength,
    #[error("CheckSumError")]
    CheckSumError,
    #[error("InvalidNameLen")]
    InvalidNameLen,
    #[error("UnknownMessageType")]
    UnknownMessageType,
    #[error("ParseError")]
    ParseError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidLength => "InvalidLength",
            ErrorCode::CheckSumError => "CheckSumError",
            ErrorCode::InvalidNameLen => "InvalidNameLen",
            ErrorCode::UnknownMessageType => "UnknownMessageType",
            ErrorCode::ParseError => "ParseError",
        }
    }
}

/// Updates a running Adler-32 checksum. Start from 1.
pub fn adler32(adler: u32, data: &[u8]) -> u32 {
    let mut a = adler & 0xffff;
    let mut b = adler >> 16;
    for chunk in data.chunks(NMAX) {
        for &byte in chunk {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    (b << 16) | a
}

/// Pulls every complete frame out of `buf`.
///
/// `handle` receives each frame body (the bytes after the length header);
/// the frame is consumed only when it returns `Ok`. Stops at the first
/// incomplete frame or error, leaving the offending bytes in place.
pub fn decode_frames<F>(buf: &mut Buffer, min_len: usize, mut handle: F) -> Result<(), ErrorCode>
where
    F: FnMut(&[u8]) -> Result<(), ErrorCode>,
{
    while buf.readable_bytes() >= HEADER_LEN + min_len {
        let len = buf.peek_i32();
        if len < 0 || (len as usize) > MAX_MESSAGE_LEN || (len as usize) < min_len {
            return Err(ErrorCode::InvalidLength);
        }
        let len = len as usize;
        if buf.readable_bytes() < HEADER_LEN + len {
            break;
        }
        handle(&buf.peek()[HEADER_LEN..HEADER_LEN + len])?;
        buf.retrieve(HEADER_LEN + len);
    }
    Ok(())
}

/// Appends the checksum of the readable bytes, then prepends the length.
pub(crate) fn seal_frame(buf: &mut Buffer) {
    let checksum = adler32(1, buf.peek());
    buf.append_i32(checksum as i32);
    let len = buf.readable_bytes() as i32;
    buf.prepend_i32(len);
}

/// Checks the trailing checksum of a frame body and strips it.
pub(crate) fn verify_checksum(data: &[u8]) -> Result<&[u8], ErrorCode> {
    if data.len() < HEADER_LEN {
        return Err(ErrorCode::InvalidLength);
    }
    let (body, tail) = data.split_at(data.len() - HEADER_LEN);
    let mut raw = [0u8; HEADER_LEN];
    raw.copy_from_slice(tail);
    let expected = i32::from_be_bytes(raw) as u32;
    if adler32(1, body) == expected {
        Ok(body)
    } else {
        Err(ErrorCode::CheckSumError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adler32_known_values() {
        assert_eq!(adler32(1, b""), 1);
        assert_eq!(adler32(1, b"Wikipedia"), 0x11E6_0398);
        assert_eq!(adler32(1, b"abc"), 0x024D_0127);
    }

    #[test]
    fn adler32_is_incremental() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let whole = adler32(1, &data);
        let (head, tail) = data.split_at(7_001);
        assert_eq!(adler32(adler32(1, head), tail), whole);
    }

    #[test]
    fn rejects_bad_lengths() {
        let mut buf = Buffer::new();
        buf.append_i32(-5);
        buf.append(&[0; 16]);
        assert_eq!(
            decode_frames(&mut buf, 10, |_| Ok(())),
            Err(ErrorCode::InvalidLength)
        );
        assert_eq!(buf.readable_bytes(), 20);

        let mut buf = Buffer::new();
        buf.append_i32(MAX_MESSAGE_LEN as i32 + 1);
        buf.append(&[0; 16]);
        assert_eq!(
            decode_frames(&mut buf, 10, |_| Ok(())),
            Err(ErrorCode::InvalidLength)
        );
    }

    #[test]
    fn incomplete_frame_waits() {
        let mut buf = Buffer::new();
        buf.append_i32(12);
        buf.append(&[1; 11]);
        let mut seen = 0;
        assert_eq!(
            decode_frames(&mut buf, 10, |_| {
                seen += 1;
                Ok(())
            }),
            Ok(())
        );
        assert_eq!(seen, 0);
        assert_eq!(buf.readable_bytes(), 15);
    }

    #[test]
    fn sealed_frame_verifies() {
        let mut buf = Buffer::new();
        buf.append(b"RPC0{}");
        seal_frame(&mut buf);
        assert_eq!(buf.peek_i32(), 10);
        let body = &buf.peek()[HEADER_LEN..];
        assert_eq!(verify_checksum(body), Ok(&b"RPC0{}"[..]));

        let mut corrupted = body.to_vec();
        corrupted[2] ^= 0x20;
        assert_eq!(verify_checksum(&corrupted), Err(ErrorCode::CheckSumError));
    }

    #[test]
    fn error_code_names() {
        assert_eq!(ErrorCode::CheckSumError.as_str(), "CheckSumError");
        assert_eq!(ErrorCode::ParseError.to_string(), "ParseError");
    }
}
