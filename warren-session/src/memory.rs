//! In-process frame transport backed by tokio mpsc channels.
//!
//! Each direction is a bounded channel carrying [`Frame`] values directly —
//! no serialization, no I/O. Useful for exercising the connection core (and
//! anything above it) without real networking: one end plays the client, the
//! other end scripts the peer.

use std::io;

use tokio::sync::mpsc;
use warren_wire::Frame;

use crate::transport::FrameTransport;

/// One end of an in-process frame link.
pub struct MemoryTransport {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

/// Create a pair of connected [`MemoryTransport`]s.
///
/// Returns `(a, b)` where frames sent on `a` arrive on `b` and vice versa.
pub fn pair(buffer: usize) -> (MemoryTransport, MemoryTransport) {
    let (tx_a, rx_b) = mpsc::channel(buffer);
    let (tx_b, rx_a) = mpsc::channel(buffer);

    let a = MemoryTransport { tx: tx_a, rx: rx_a };
    let b = MemoryTransport { tx: tx_b, rx: rx_b };
    (a, b)
}

impl MemoryTransport {
    fn disconnected() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "peer dropped")
    }
}

impl FrameTransport for MemoryTransport {
    async fn send(&mut self, frame: &Frame) -> io::Result<()> {
        self.tx
            .send(frame.clone())
            .await
            .map_err(|_| Self::disconnected())
    }

    async fn send_all(&mut self, frames: &[Frame]) -> io::Result<()> {
        for frame in frames {
            self.send(frame).await?;
        }
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<Option<Frame>> {
        Ok(self.rx.recv().await)
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        // Dropping the sender would close the channel, but the transport may
        // still need to drain a best-effort close handshake. Closing the
        // receiving side is enough to signal teardown to the peer.
        self.rx.close();
        Ok(())
    }
}
