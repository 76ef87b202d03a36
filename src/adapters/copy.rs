use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::io::poll_read_buf;

/// Bytes asked of the source per read
const READ_CHUNK: usize = 16 * 1024;

use crate::core::backpressure::{Directive, Governor};

/// One direction of a relayed byte stream, with backpressure.
///
/// Pulls from the source while the governor allows, stages into a buffer,
/// and drains to the destination as it accepts writes. Reads pause at the
/// governor's high-water mark and resume at its low-water mark, so a slow
/// destination caps memory instead of growing the staging buffer. On
/// source EOF the staged remainder is flushed and the destination's write
/// side is shut down, propagating the half-close.
#[derive(Debug)]
pub struct RelayCopy {
    staged: BytesMut,
    governor: Governor,
    read_done: bool,
    flushed: bool,
    relayed: u64,
    label: &'static str,
}

impl RelayCopy {
    pub fn new(max_pending: usize, label: &'static str) -> Self {
        Self {
            staged: BytesMut::with_capacity(READ_CHUNK),
            governor: Governor::new(max_pending),
            read_done: false,
            flushed: false,
            relayed: 0,
            label,
        }
    }

    /// Total bytes handed to the destination so far
    pub fn relayed(&self) -> u64 {
        self.relayed
    }

    /// Drive the transfer as far as it can go right now.
    ///
    /// Completes with the relayed byte count once the source reached EOF
    /// and everything staged was written and flushed.
    pub fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut src: Pin<&mut R>,
        mut dst: Pin<&mut W>,
    ) -> Poll<io::Result<u64>>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            let mut progressed = false;

            while !self.read_done && !self.governor.is_paused() {
                self.staged.reserve(READ_CHUNK);
                match poll_read_buf(src.as_mut(), cx, &mut self.staged) {
                    Poll::Ready(Ok(0)) => {
                        self.read_done = true;
                        progressed = true;
                    }
                    Poll::Ready(Ok(_)) => {
                        progressed = true;
                        if self.governor.on_buffered(self.staged.len()) == Directive::PauseReads {
                            tracing::trace!(
                                direction = self.label,
                                pending = self.staged.len(),
                                "pausing source reads"
                            );
                        }
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => break,
                }
            }

            while !self.staged.is_empty() {
                match dst.as_mut().poll_write(cx, &self.staged) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                    }
                    Poll::Ready(Ok(written)) => {
                        self.staged.advance(written);
                        self.relayed += written as u64;
                        progressed = true;
                        if self.governor.on_drained(self.staged.len(), false)
                            == Directive::ResumeReads
                        {
                            tracing::trace!(
                                direction = self.label,
                                pending = self.staged.len(),
                                "resuming source reads"
                            );
                        }
                    }
                    Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                    Poll::Pending => break,
                }
            }

            if self.read_done && self.staged.is_empty() {
                if !self.flushed {
                    ready!(dst.as_mut().poll_flush(cx))?;
                    self.flushed = true;
                }
                ready!(dst.as_mut().poll_shutdown(cx))?;
                return Poll::Ready(Ok(self.relayed));
            }

            if !progressed {
                return Poll::Pending;
            }
        }
    }

    /// Run the transfer to completion
    pub async fn transfer<R, W>(mut self, mut src: R, mut dst: W) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        std::future::poll_fn(|cx| self.poll_transfer(cx, Pin::new(&mut src), Pin::new(&mut dst)))
            .await
    }
}

/// Relay raw bytes in both directions until each side closes.
///
/// Returns (client-to-origin, origin-to-client) byte counts. Each
/// direction propagates EOF as a half-close, so a clean shutdown on one
/// side lets the other finish draining.
pub async fn tunnel<A, B>(front: &mut A, back: &mut B, max_pending: usize) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (front_read, front_write) = tokio::io::split(front);
    let (back_read, back_write) = tokio::io::split(back);

    let up = RelayCopy::new(max_pending, "tunnel-up").transfer(front_read, back_write);
    let down = RelayCopy::new(max_pending, "tunnel-down").transfer(back_read, front_write);

    let (up_bytes, down_bytes) = tokio::join!(up, down);
    Ok((up_bytes?, down_bytes?))
}
