//! Codec-based framing for async byte streams.
//!
//! Inbound: bytes are appended to a receive buffer and handed to the codec,
//! which peels zero or one frame off the front per call. Outbound: frames are
//! encoded into a single per-connection byte buffer, then the buffer is
//! drained to the stream; `send_all` encodes a whole submission before the
//! first write, so its frames are never interleaved with other traffic.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;
use warren_session::FrameTransport;
use warren_wire::Frame;

/// Bytes ↔ frames contract.
///
/// The wire format itself is the codec's business; this crate only manages
/// buffering and stream I/O around it.
pub trait FrameCodec: Send {
    /// Append the wire encoding of `frame` to `out`.
    fn encode(&self, frame: &Frame, out: &mut Vec<u8>) -> io::Result<()>;

    /// Decode zero or one frame from the front of `buf`.
    ///
    /// Returns the number of bytes consumed and the decoded frame, if one was
    /// complete. `(0, None)` means more bytes are needed. Malformed input is
    /// an error, not a silent skip.
    fn decode(&self, buf: &[u8]) -> io::Result<(usize, Option<Frame>)>;
}

const RECV_BUF_COMPACT_THRESHOLD: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

/// A frame transport over any `AsyncRead + AsyncWrite` stream plus a codec.
pub struct CodecFramed<S, C> {
    stream: S,
    codec: C,
    buf: Vec<u8>,
    unread_start: usize,
    /// Single outbound byte buffer shared by the whole connection.
    out_buf: Vec<u8>,
}

impl<S, C> CodecFramed<S, C> {
    pub fn new(stream: S, codec: C) -> Self {
        Self {
            stream,
            codec,
            buf: Vec::new(),
            unread_start: 0,
            out_buf: Vec::with_capacity(1024),
        }
    }

    /// Get a reference to the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Consume the framed wrapper and return the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn compact_recv_buffer(&mut self) {
        if self.unread_start == self.buf.len() {
            self.buf.clear();
            self.unread_start = 0;
            return;
        }
        if self.unread_start >= RECV_BUF_COMPACT_THRESHOLD
            && self.unread_start >= self.buf.len() / 2
        {
            self.buf.drain(..self.unread_start);
            self.unread_start = 0;
        }
    }
}

impl<S, C> CodecFramed<S, C>
where
    C: FrameCodec,
{
    /// Run the codec over the buffered bytes until it produces a frame or
    /// asks for more input.
    fn try_decode_buffered(&mut self) -> io::Result<Option<Frame>> {
        loop {
            let unread = &self.buf[self.unread_start..];
            if unread.is_empty() {
                return Ok(None);
            }
            let (consumed, frame) = self.codec.decode(unread)?;
            self.unread_start += consumed;
            if let Some(frame) = frame {
                self.compact_recv_buffer();
                return Ok(Some(frame));
            }
            if consumed == 0 {
                return Ok(None);
            }
        }
    }
}

impl<S, C> FrameTransport for CodecFramed<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    C: FrameCodec,
{
    async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        trace!(?frame, "send");
        self.codec.encode(frame, &mut self.out_buf)?;
        self.flush_outbound().await
    }

    async fn send_all(&mut self, frames: &[Frame]) -> io::Result<()> {
        for frame in frames {
            trace!(?frame, "send");
            self.codec.encode(frame, &mut self.out_buf)?;
        }
        self.flush_outbound().await
    }

    async fn recv(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.try_decode_buffered()? {
                trace!(?frame, "recv");
                return Ok(Some(frame));
            }

            let mut tmp = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut tmp).await?;
            if n == 0 {
                let trailing = self.buf.len() - self.unread_start;
                if trailing != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("eof with {trailing} trailing bytes and no complete frame"),
                    ));
                }
                return Ok(None);
            }
            self.compact_recv_buffer();
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

impl<S, C> CodecFramed<S, C>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn flush_outbound(&mut self) -> io::Result<()> {
        if self.out_buf.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.out_buf).await?;
        self.stream.flush().await?;
        self.out_buf.clear();
        Ok(())
    }
}
