use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tracing::trace;

use crate::error::{PgWireError, Result};
use crate::protocol::backend::BackendMessage;
use crate::protocol::framing::{Frame, split_frame};
use crate::protocol::frontend::FrontendMessage;

const READ_CHUNK: usize = 8 * 1024;

/// Buffered duplex stream speaking protocol 3 frames.
///
/// Outgoing messages accumulate in a write buffer until [`flush`](Self::flush).
/// Incoming bytes accumulate in a read buffer that frames are split from, so a
/// read abandoned mid-frame (e.g. by a timeout) loses nothing.
pub struct PgStream<S> {
    io: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PgStream<S> {
    pub fn new(io: S) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::with_capacity(1024),
        }
    }

    /// Queue a message. Nothing is transmitted until `flush`.
    pub fn send(&mut self, msg: FrontendMessage<'_>) {
        trace!(tag = %(msg.tag() as char), "queue frontend message");
        msg.encode(&mut self.write_buf);
    }

    pub(crate) fn write_buf_mut(&mut self) -> &mut BytesMut {
        &mut self.write_buf
    }

    /// Transmit everything queued.
    pub async fn flush(&mut self) -> Result<()> {
        trace!(bytes = self.write_buf.len(), "flush");
        self.io.write_all_buf(&mut self.write_buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }

    /// Read at least one more byte into the read buffer.
    ///
    /// Cancel-safe: bytes are only ever appended to the buffer.
    pub async fn fill(&mut self) -> Result<()> {
        if self.read_buf.capacity() - self.read_buf.len() < READ_CHUNK / 4 {
            self.read_buf.reserve(READ_CHUNK);
        }
        let n = self.io.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            return Err(PgWireError::Io("connection closed by server".into()));
        }
        Ok(())
    }

    /// Like [`fill`](Self::fill) but gives up at `deadline`, returning `false`.
    pub async fn fill_until(&mut self, deadline: Instant) -> Result<bool> {
        match timeout_at(deadline, self.fill()).await {
            Ok(res) => res.map(|()| true),
            Err(_) => Ok(false),
        }
    }

    /// Bytes received but not consumed yet.
    #[inline]
    pub fn buffered(&self) -> &[u8] {
        &self.read_buf
    }

    pub(crate) fn consume(&mut self, n: usize) -> Bytes {
        self.read_buf.split_to(n).freeze()
    }

    pub(crate) fn discard(&mut self, n: usize) {
        self.read_buf.advance(n);
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut S, &mut BytesMut) {
        (&mut self.io, &mut self.read_buf)
    }

    /// Next complete frame if one is already buffered.
    pub fn try_frame(&mut self) -> Result<Option<Frame>> {
        split_frame(&mut self.read_buf)
    }

    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.try_frame()? {
                return Ok(frame);
            }
            self.fill().await?;
        }
    }

    pub async fn read_message(&mut self) -> Result<BackendMessage> {
        let frame = self.read_frame().await?;
        trace!(
            tag = %(frame.tag as char),
            len = frame.payload.len(),
            "recv {}",
            BackendMessage::message_name(frame.tag)
        );
        BackendMessage::from_frame(frame)
    }
}
