#![deny(unsafe_code)]

//! Connection core for a framed, multiplexed messaging protocol.
//!
//! One byte stream carries an interleaved set of logical channels. This crate
//! turns decoded frames into dispatched protocol traffic and back:
//!
//! - handshake sequencing (protocol header → authentication → tuning →
//!   virtual-host open) via [`establish`]
//! - channel allocation and inbound frame routing
//! - synchronous RPC semantics on top of the asynchronous transport
//! - content fragmentation against the negotiated frame-max
//! - close-reason propagation from the connection to every channel
//!
//! All connection state is owned by a single [`Driver`] task. Application
//! code talks to it through cloneable handles ([`ConnectionHandle`],
//! [`ChannelHandle`]) backed by a command channel, so there is no locking and
//! frames are dispatched strictly in arrival order.
//!
//! The byte-level frame encoding and the concrete socket both live behind the
//! [`FrameTransport`] trait; see `warren-stream` for the byte-stream adapter
//! and [`memory`] for an in-process pair used in tests.
//!
//! # Example
//!
//! ```ignore
//! use warren_session::{establish, ConnectionConfig, NoEvents};
//!
//! let (handle, driver) = establish(transport, ConnectionConfig::default(), NoEvents).await?;
//! tokio::spawn(driver.run());
//!
//! let channel = handle.open_channel().await?;
//! let reply = channel
//!     .call(Method::ChannelOpen, &[MethodKind::ChannelOpenOk])
//!     .await?;
//! ```

mod channel;
mod config;
mod connection;
mod credentials;
mod driver;
mod errors;
pub mod memory;
mod outbound;
mod transport;
mod tuning;

pub use channel::{ChannelEvent, CloseCell};
pub use config::ConnectionConfig;
pub use connection::establish;
pub use credentials::{Credentials, PlainCredentials};
pub use driver::{ChannelHandle, ConnectionEvents, ConnectionHandle, Driver, NoEvents};
pub use errors::{CallError, ConnectionError};
pub use outbound::{content_frames, Content};
pub use transport::FrameTransport;
pub use tuning::{combine, TuningParams};

// Re-export wire types for convenience
pub use warren_wire::{ChannelId, CloseReason, Frame, Method, MethodKind};
