//! Outbound frame writer.
//!
//! Turns one method submission (optionally with content) into the ordered
//! wire frames representing it: method frame, then a content header when
//! properties are present, then body frames fragmented against the negotiated
//! frame-max. The driver enqueues a whole submission into the transport
//! before yielding, so submissions are never interleaved.

use bytes::Bytes;
use warren_wire::{ChannelId, ContentProperties, Frame, Method, FRAME_OVERHEAD};

/// Content attached to an outbound method.
#[derive(Debug, Clone, Default)]
pub struct Content {
    /// Properties announced in a content-header frame. When `None`, no
    /// header frame is emitted.
    pub properties: Option<ContentProperties>,
    /// Body bytes, fragmented across content-body frames as needed.
    pub body: Bytes,
}

impl Content {
    pub fn body(body: impl Into<Bytes>) -> Self {
        Self {
            properties: None,
            body: body.into(),
        }
    }

    pub fn with_properties(properties: ContentProperties, body: impl Into<Bytes>) -> Self {
        Self {
            properties: Some(properties),
            body: body.into(),
        }
    }
}

/// Produce the wire frames for one submission, in transmission order.
///
/// Each content-body frame carries at most `frame_max − 8` payload bytes
/// (the per-frame header and footer overhead). Pieces are split in order
/// with no gaps, so their concatenation is the original body. `frame_max`
/// must be the negotiated value; content cannot be produced before tuning
/// completes.
pub fn content_frames(
    channel: ChannelId,
    method: Method,
    content: Option<Content>,
    frame_max: u32,
) -> Vec<Frame> {
    let mut frames = vec![Frame::Method { channel, method }];
    let Some(content) = content else {
        return frames;
    };

    let mut body = content.body;
    if let Some(properties) = content.properties {
        frames.push(Frame::ContentHeader {
            channel,
            body_size: body.len() as u64,
            properties,
        });
    }

    let max_piece = frame_max as usize - FRAME_OVERHEAD;
    while !body.is_empty() {
        let piece = body.split_to(body.len().min(max_piece));
        frames.push(Frame::ContentBody {
            channel,
            payload: piece,
        });
    }
    frames
}
