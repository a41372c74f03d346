use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PgWireError, Result};

/// Frame header: tag (1) + length (4).
pub const HEADER_LEN: usize = 5;

/// Upper bound on a declared message length. Anything larger is treated as a
/// misaligned stream rather than an allocation request.
pub const MAX_MESSAGE_LEN: usize = 1 << 30;

/// Protocol 3.0 (196608).
pub const PROTOCOL_VERSION_3: i32 = 196_608;

/// One backend message as it came off the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes, // payload excludes the 4-byte length field
}

/// Inspect the header at the front of `buf` without consuming anything.
///
/// Returns the tag and the payload length, or `None` if fewer than
/// [`HEADER_LEN`] bytes are buffered.
pub fn peek_header(buf: &[u8]) -> Result<Option<(u8, usize)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let tag = buf[0];
    let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(PgWireError::protocol(format!(
            "invalid backend message length {len} for tag 0x{tag:02x}"
        )));
    }
    Ok(Some((tag, len as usize - 4)))
}

/// Remove one complete frame from the front of `buf`.
///
/// Returns `None` (leaving `buf` untouched) until the whole frame is buffered,
/// so callers may retry after reading more bytes.
pub fn split_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    let Some((tag, payload_len)) = peek_header(buf)? else {
        return Ok(None);
    };
    if buf.len() < HEADER_LEN + payload_len {
        buf.reserve(HEADER_LEN + payload_len - buf.len());
        return Ok(None);
    }
    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).freeze();
    Ok(Some(Frame { tag, payload }))
}

/// Startup message. It carries no tag byte, only length and version.
pub fn write_startup(buf: &mut BytesMut, protocol_version: i32, params: &[(&str, &str)]) {
    let offset = buf.len();
    buf.put_i32(0); // length placeholder
    buf.put_i32(protocol_version);

    for (k, v) in params {
        put_cstr(buf, k);
        put_cstr(buf, v);
    }
    buf.put_u8(0); // terminator

    let len = (buf.len() - offset) as i32;
    buf[offset..offset + 4].copy_from_slice(&len.to_be_bytes());
}

/// Fail if `s` cannot be written as a cstring.
pub(crate) fn check_cstr(what: &str, s: &str) -> Result<()> {
    if s.contains('\0') {
        return Err(PgWireError::protocol(format!("{what} contains a NUL byte")));
    }
    Ok(())
}

pub(crate) fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Bounds-checked reader over a message payload.
///
/// Every read fails with a framing error instead of panicking when the
/// payload is shorter than its layout, and [`finish`](Self::finish) rejects
/// trailing bytes.
pub struct PayloadReader {
    what: &'static str,
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(what: &'static str, buf: Bytes) -> Self {
        Self { what, buf }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(PgWireError::protocol(format!(
                "{} payload too short: {} bytes left, need {n}",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn i16(&mut self) -> Result<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn bytes(&mut self, n: usize) -> Result<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    /// A nul-terminated string.
    pub fn cstr(&mut self) -> Result<String> {
        let pos = self.buf.iter().position(|&b| b == 0).ok_or_else(|| {
            PgWireError::protocol(format!("{} payload has unterminated string", self.what))
        })?;
        let s = String::from_utf8_lossy(&self.buf[..pos]).into_owned();
        self.buf.advance(pos + 1);
        Ok(s)
    }

    pub fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// Assert the layout consumed the payload exactly.
    pub fn finish(self) -> Result<()> {
        if self.buf.has_remaining() {
            return Err(PgWireError::protocol(format!(
                "{} payload has {} trailing bytes",
                self.what,
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}
