#![allow(dead_code)]

//! Shared fake-peer helpers for the integration tests.
//!
//! One end of an in-memory transport pair plays the server: it walks the
//! handshake script and records every frame the client sent, so tests can
//! assert on the exact outbound sequence.

use tracing_subscriber::EnvFilter;
use warren_session::memory::MemoryTransport;
use warren_session::FrameTransport;
use warren_wire::{Frame, Method};

/// Opt-in log output while debugging: `WARREN_LOG=trace cargo test ...`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("WARREN_LOG"))
        .try_init();
}

/// Frame-max offered by the scripted peer; small enough to make
/// fragmentation observable.
pub const TEST_FRAME_MAX: u32 = 4096;

/// Receive the next frame, panicking on transport errors or EOF.
pub async fn expect_frame(io: &mut MemoryTransport) -> Frame {
    io.recv()
        .await
        .expect("peer transport failed")
        .expect("peer saw eof")
}

/// Serve the full server side of the handshake with default parameters and
/// return the frames the client sent, in order.
pub async fn serve_handshake(io: &mut MemoryTransport) -> Vec<Frame> {
    serve_handshake_with(io, "PLAIN", TEST_FRAME_MAX).await
}

/// Serve the peer side of a graceful close: expect the client's close,
/// acknowledge it.
pub async fn serve_close(io: &mut MemoryTransport) {
    match expect_frame(io).await {
        Frame::Method {
            channel: 0,
            method: Method::ConnectionClose { reply_code, .. },
        } => {
            assert_eq!(reply_code, 200);
            io.send(&Frame::Method {
                channel: 0,
                method: Method::ConnectionCloseOk,
            })
            .await
            .unwrap();
        }
        other => panic!("expected connection close, got {other:?}"),
    }
}

pub async fn serve_handshake_with(
    io: &mut MemoryTransport,
    mechanisms: &str,
    frame_max: u32,
) -> Vec<Frame> {
    let mut seen = Vec::new();

    let header = expect_frame(io).await;
    assert!(
        matches!(header, Frame::ProtocolHeader(_)),
        "expected protocol header, got {header:?}"
    );
    seen.push(header);

    io.send(&Frame::Method {
        channel: 0,
        method: Method::ConnectionStart {
            version_major: 0,
            version_minor: 9,
            mechanisms: mechanisms.to_string(),
            locales: "en_US".to_string(),
        },
    })
    .await
    .unwrap();

    let start_ok = expect_frame(io).await;
    assert!(
        matches!(
            start_ok,
            Frame::Method {
                channel: 0,
                method: Method::ConnectionStartOk { .. }
            }
        ),
        "expected start-ok, got {start_ok:?}"
    );
    seen.push(start_ok);

    io.send(&Frame::Method {
        channel: 0,
        method: Method::ConnectionTune {
            channel_max: 0,
            frame_max,
            heartbeat: 0,
        },
    })
    .await
    .unwrap();

    let tune_ok = expect_frame(io).await;
    seen.push(tune_ok);

    let open = expect_frame(io).await;
    assert!(
        matches!(
            open,
            Frame::Method {
                channel: 0,
                method: Method::ConnectionOpen { .. }
            }
        ),
        "expected open, got {open:?}"
    );
    seen.push(open);

    io.send(&Frame::Method {
        channel: 0,
        method: Method::ConnectionOpenOk {
            known_hosts: String::new(),
        },
    })
    .await
    .unwrap();

    seen
}
