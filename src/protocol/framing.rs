//! Frontend/backend frame codec.
//!
//! Backend frames are `tag (1) + length (4, includes itself) + payload`.
//! Decoding is incremental over a [`BytesMut`] read buffer: a frame is only
//! consumed once all of its bytes have arrived, so a timed-out read never
//! loses protocol synchronization.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ReplicationError, Result};

/// Maximum backend frame size (1GB) - prevents memory exhaustion from
/// malformed length fields. This is more than enough.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024 * 1024;

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196_608;

/// SSLRequest magic code.
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

/// One backend message, tag plus payload (length field stripped).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFrame {
    pub tag: u8,
    pub payload: Bytes,
}

impl BackendFrame {
    /// Returns true if this is an ErrorResponse ('E')
    #[inline]
    pub fn is_error(&self) -> bool {
        self.tag == b'E'
    }

    /// Returns true if this is CopyData ('d')
    #[inline]
    pub fn is_copy_data(&self) -> bool {
        self.tag == b'd'
    }

    /// Returns true if this is CopyBothResponse ('W')
    #[inline]
    pub fn is_copy_both_response(&self) -> bool {
        self.tag == b'W'
    }
}

/// Try to decode one complete frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; `buf` is left untouched in
/// that case apart from capacity reservation.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<BackendFrame>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let tag = buf[0];
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 {
        return Err(ReplicationError::Protocol(format!(
            "invalid backend frame length: {len}"
        )));
    }
    let payload_len = (len - 4) as usize;
    if payload_len > MAX_FRAME_SIZE {
        return Err(ReplicationError::Protocol(format!(
            "backend frame too large: {payload_len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }
    let total = 1 + 4 + payload_len;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    buf.advance(5);
    let payload = buf.split_to(payload_len).freeze();
    Ok(Some(BackendFrame { tag, payload }))
}

/// Startup message: no tag byte, length + protocol version + `key\0value\0`
/// pairs + terminator.
pub fn startup_message<'a>(params: impl IntoIterator<Item = (&'a str, &'a str)>) -> BytesMut {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_i32(0); // length placeholder
    buf.put_i32(PROTOCOL_VERSION);
    for (k, v) in params {
        buf.extend_from_slice(k.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(v.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0);
    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    buf
}

pub fn ssl_request() -> BytesMut {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i32(8);
    buf.put_i32(SSL_REQUEST_CODE);
    buf
}

fn tagged(tag: u8, body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u8(tag);
    buf.put_i32((4 + body.len()) as i32);
    buf.extend_from_slice(body);
    buf
}

pub fn query(sql: &str) -> BytesMut {
    let mut body = Vec::with_capacity(sql.len() + 1);
    body.extend_from_slice(sql.as_bytes());
    body.push(0);
    tagged(b'Q', &body)
}

pub fn password_message(payload: &[u8]) -> BytesMut {
    tagged(b'p', payload)
}

pub fn copy_data(payload: &[u8]) -> BytesMut {
    tagged(b'd', payload)
}

pub fn copy_done() -> BytesMut {
    tagged(b'c', &[])
}

pub fn terminate() -> BytesMut {
    tagged(b'X', &[])
}
