use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::connection::PgStream;

/// Body of the current WAL data frame as an [`AsyncRead`].
///
/// Yields exactly the bytes of the body, then EOF. Whatever is left unread
/// is discarded by the next `fetch_next`.
pub struct WalDataReader<'a, S> {
    stream: &'a mut PgStream<S>,
    remaining: &'a mut usize,
}

impl<'a, S> WalDataReader<'a, S> {
    pub(crate) fn new(stream: &'a mut PgStream<S>, remaining: &'a mut usize) -> Self {
        Self { stream, remaining }
    }

    /// Body bytes not read yet.
    pub fn remaining(&self) -> usize {
        *self.remaining
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WalDataReader<'_, S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if *this.remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let limit = (*this.remaining).min(buf.remaining());
        let (io, read_buf) = this.stream.parts_mut();

        // drain what is already buffered before touching the socket
        if !read_buf.is_empty() {
            let n = limit.min(read_buf.len());
            buf.put_slice(&read_buf[..n]);
            read_buf.advance(n);
            *this.remaining -= n;
            return Poll::Ready(Ok(()));
        }

        let dst = buf.initialize_unfilled_to(limit);
        let mut direct = ReadBuf::new(dst);
        ready!(Pin::new(io).poll_read(cx, &mut direct))?;
        let n = direct.filled().len();
        if n == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside WAL data body",
            )));
        }
        buf.advance(n);
        *this.remaining -= n;
        Poll::Ready(Ok(()))
    }
}
