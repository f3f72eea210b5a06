#![deny(unsafe_code)]

//! Byte-stream transport layer for the warren connection core.
//!
//! This crate adapts any async byte stream (TCP, Unix sockets, in-memory
//! duplex pipes) into the session crate's `FrameTransport`:
//!
//! - [`FrameCodec`] is the contract for the wire encoding — bytes to frames
//!   and back. The protocol's actual marshaling rules live in codec
//!   implementations, not here.
//! - [`CodecFramed`] pairs a stream with a codec, buffers partial reads, and
//!   keeps one outbound byte buffer per connection so a whole submission is
//!   encoded before anything is written.
//!
//! # Example
//!
//! ```ignore
//! use warren_session::{establish, ConnectionConfig, NoEvents};
//! use warren_stream::CodecFramed;
//!
//! let stream = TcpStream::connect(("localhost", warren_wire::PROTOCOL_PORT)).await?;
//! let io = CodecFramed::new(stream, MyCodec);
//! let (handle, driver) = establish(io, ConnectionConfig::default(), NoEvents).await?;
//! tokio::spawn(driver.run());
//! ```

mod framing;

pub use framing::{CodecFramed, FrameCodec};
