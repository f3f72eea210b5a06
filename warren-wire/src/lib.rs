#![deny(unsafe_code)]

//! Wire-level value types for the warren protocol core.
//!
//! This crate holds the value types exchanged between the connection core and
//! its collaborators: [`Frame`], the [`Method`] catalogue, content properties,
//! and close reasons. It performs no I/O and no byte-level marshaling — the
//! bytes ↔ frame boundary belongs to a codec implementation behind
//! `warren-stream`'s `FrameCodec` trait.

use bytes::Bytes;

/// Registered port for the protocol.
pub const PROTOCOL_PORT: u16 = 5672;

/// Protocol version sent in our protocol header.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 0,
    minor: 9,
    revision: 1,
};

/// Size of the fixed frame header on the wire (type, channel, length).
pub const FRAME_HEADER_SIZE: usize = 7;

/// Size of the frame-end octet.
pub const FRAME_END_SIZE: usize = 1;

/// Per-frame overhead: everything that is not payload.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + FRAME_END_SIZE;

/// Smallest frame-max any peer may negotiate.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Default frame-max requested by a fresh connection.
pub const DEFAULT_FRAME_MAX: u32 = 131072;

/// Channel-number ceiling used when the negotiated channel-max is 0 (unlimited).
pub const CHANNEL_MAX_FALLBACK: u16 = 32767;

/// Channel number type.
///
/// Channel 0 is reserved for connection-level control traffic.
pub type ChannelId = u16;

/// The reserved connection-control channel.
pub const CONTROL_CHANNEL: ChannelId = 0;

/// Protocol version triple carried in protocol-header frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u8,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.major, self.minor, self.revision)
    }
}

/// Well-known reply codes used in close reasons.
pub mod reply_code {
    /// Normal, successful completion.
    pub const REPLY_SUCCESS: u16 = 200;
    /// Peer forced the connection closed.
    pub const CONNECTION_FORCED: u16 = 320;
    /// A frame arrived that no handler could accept.
    pub const UNEXPECTED_FRAME: u16 = 505;
}

// ============================================================================
// Frames
// ============================================================================

/// One unit of the wire protocol.
///
/// Frames are transient: the codec produces them on read and the connection
/// core consumes them immediately. They are never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Version announcement exchanged before any other traffic. A peer that
    /// answers our header with its own header is signaling a version mismatch.
    ProtocolHeader(ProtocolVersion),
    /// A method call or notification on a channel.
    Method { channel: ChannelId, method: Method },
    /// Announces a content body: total size plus its properties.
    ContentHeader {
        channel: ChannelId,
        body_size: u64,
        properties: ContentProperties,
    },
    /// One piece of a (possibly fragmented) content body.
    ContentBody { channel: ChannelId, payload: Bytes },
    /// Liveness probe; echoed back verbatim by the receiver.
    Heartbeat { channel: ChannelId },
}

impl Frame {
    /// The channel this frame belongs to (0 for connection control and
    /// protocol headers).
    pub fn channel(&self) -> ChannelId {
        match self {
            Frame::ProtocolHeader(_) => CONTROL_CHANNEL,
            Frame::Method { channel, .. }
            | Frame::ContentHeader { channel, .. }
            | Frame::ContentBody { channel, .. }
            | Frame::Heartbeat { channel } => *channel,
        }
    }
}

// ============================================================================
// Content properties
// ============================================================================

/// Properties attached to a content body via a content-header frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub delivery_mode: Option<u8>,
    pub headers: Vec<(String, String)>,
}

// ============================================================================
// Method catalogue
// ============================================================================

/// A named, typed remote call or notification exchanged as a frame payload.
///
/// The catalogue covers the connection class (handshake and lifecycle) and the
/// channel class (open/close of logical channels). Variant field layouts
/// follow the protocol definitions; numeric identifiers live in
/// [`MethodKind::class_and_method`].
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    /// Server greets the client and advertises authentication mechanisms.
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        mechanisms: String,
        locales: String,
    },
    /// Client answers with its chosen mechanism and opaque response bytes.
    ConnectionStartOk {
        client_properties: Vec<(String, String)>,
        mechanism: String,
        response: Vec<u8>,
        locale: String,
    },
    /// Server proposes tunable limits.
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    /// Client confirms the agreed limits.
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    /// Client asks to open a virtual host.
    ConnectionOpen { virtual_host: String, insist: bool },
    /// Server acknowledges the virtual-host open.
    ConnectionOpenOk { known_hosts: String },
    /// Either side initiates connection shutdown.
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    /// Acknowledges a connection close.
    ConnectionCloseOk,
    /// Client opens a logical channel.
    ChannelOpen,
    /// Server acknowledges a channel open.
    ChannelOpenOk,
    /// Either side closes a logical channel.
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    /// Acknowledges a channel close.
    ChannelCloseOk,
}

impl Method {
    /// The kind discriminant, used for reply matching and subscriptions.
    pub fn kind(&self) -> MethodKind {
        match self {
            Method::ConnectionStart { .. } => MethodKind::ConnectionStart,
            Method::ConnectionStartOk { .. } => MethodKind::ConnectionStartOk,
            Method::ConnectionTune { .. } => MethodKind::ConnectionTune,
            Method::ConnectionTuneOk { .. } => MethodKind::ConnectionTuneOk,
            Method::ConnectionOpen { .. } => MethodKind::ConnectionOpen,
            Method::ConnectionOpenOk { .. } => MethodKind::ConnectionOpenOk,
            Method::ConnectionClose { .. } => MethodKind::ConnectionClose,
            Method::ConnectionCloseOk => MethodKind::ConnectionCloseOk,
            Method::ChannelOpen => MethodKind::ChannelOpen,
            Method::ChannelOpenOk => MethodKind::ChannelOpenOk,
            Method::ChannelClose { .. } => MethodKind::ChannelClose,
            Method::ChannelCloseOk => MethodKind::ChannelCloseOk,
        }
    }

    /// Numeric class identifier.
    pub fn class_id(&self) -> u16 {
        self.kind().class_and_method().0
    }

    /// Numeric method identifier within the class.
    pub fn method_id(&self) -> u16 {
        self.kind().class_and_method().1
    }
}

/// Discriminant-only view of [`Method`].
///
/// Used wherever a method must be named without carrying its fields: the
/// acceptable-reply sets of synchronous calls and the per-channel
/// notification subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    ConnectionStart,
    ConnectionStartOk,
    ConnectionTune,
    ConnectionTuneOk,
    ConnectionOpen,
    ConnectionOpenOk,
    ConnectionClose,
    ConnectionCloseOk,
    ChannelOpen,
    ChannelOpenOk,
    ChannelClose,
    ChannelCloseOk,
}

impl MethodKind {
    /// Numeric (class, method) identifier pair.
    pub fn class_and_method(self) -> (u16, u16) {
        match self {
            MethodKind::ConnectionStart => (10, 10),
            MethodKind::ConnectionStartOk => (10, 11),
            MethodKind::ConnectionTune => (10, 30),
            MethodKind::ConnectionTuneOk => (10, 31),
            MethodKind::ConnectionOpen => (10, 40),
            MethodKind::ConnectionOpenOk => (10, 41),
            MethodKind::ConnectionClose => (10, 50),
            MethodKind::ConnectionCloseOk => (10, 51),
            MethodKind::ChannelOpen => (20, 10),
            MethodKind::ChannelOpenOk => (20, 11),
            MethodKind::ChannelClose => (20, 40),
            MethodKind::ChannelCloseOk => (20, 41),
        }
    }
}

impl std::fmt::Display for MethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (class, method) = self.class_and_method();
        write!(f, "{self:?}({class}.{method})")
    }
}

// ============================================================================
// Close reasons
// ============================================================================

/// Immutable record of why a connection or channel stopped operating.
///
/// `class_id`/`method_id` identify the offending method when the close was
/// triggered by one, and are 0 otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl CloseReason {
    /// A close reason not tied to any offending method.
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            class_id: 0,
            method_id: 0,
        }
    }

    /// The reason sent on a graceful local shutdown.
    pub fn normal() -> Self {
        Self::new(reply_code::REPLY_SUCCESS, "Normal shutdown")
    }

    /// The reason synthesized when the transport fails or disconnects.
    pub fn socket_closed() -> Self {
        Self::new(0, "Socket closed")
    }

    /// The reason synthesized when an unroutable or unacceptable frame arrives.
    pub fn unexpected_frame() -> Self {
        Self::new(reply_code::UNEXPECTED_FRAME, "UNEXPECTED_FRAME")
    }

    /// Extract the close reason carried by a connection- or channel-close
    /// method. Returns `None` for any other method.
    pub fn from_method(method: &Method) -> Option<Self> {
        match method {
            Method::ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | Method::ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => Some(Self {
                code: *reply_code,
                text: reply_text.clone(),
                class_id: *class_id,
                method_id: *method_id,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.class_id == 0 && self.method_id == 0 {
            write!(f, "({}) {}", self.code, self.text)
        } else {
            write!(
                f,
                "({}) {} [method {}.{}]",
                self.code, self.text, self.class_id, self.method_id
            )
        }
    }
}
