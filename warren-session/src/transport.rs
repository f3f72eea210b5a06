//! Frame transport abstraction.
//!
//! The connection core speaks frames; everything below — byte-level codec,
//! sockets, buffering — lives behind this trait. Implementations:
//!
//! - `CodecFramed` in `warren-stream` for byte streams plus an injected codec
//! - [`memory::pair`](crate::memory::pair) for in-process testing

use std::io;

use warren_wire::Frame;

/// A transport that can send and receive whole frames.
pub trait FrameTransport: Send {
    /// Send one frame.
    fn send(&mut self, frame: &Frame) -> impl std::future::Future<Output = io::Result<()>> + Send;

    /// Send every frame of one submission before returning.
    ///
    /// Implementations must not interleave other traffic between these
    /// frames; a method/header/body sequence travels contiguously.
    fn send_all(
        &mut self,
        frames: &[Frame],
    ) -> impl std::future::Future<Output = io::Result<()>> + Send;

    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` on orderly end-of-stream.
    fn recv(&mut self) -> impl std::future::Future<Output = io::Result<Option<Frame>>> + Send;

    /// Tear down the underlying transport. Best-effort; called at most once
    /// during close.
    fn shutdown(&mut self) -> impl std::future::Future<Output = io::Result<()>> + Send;
}
