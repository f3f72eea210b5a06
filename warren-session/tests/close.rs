//! Close propagation integration tests: local close, peer close, transport
//! loss, and the failure of operations after a reason is recorded.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use support::{expect_frame, serve_close, serve_handshake};
use warren_session::memory::pair;
use warren_session::{
    establish, CallError, ConnectionConfig, ConnectionEvents, FrameTransport, NoEvents,
};
use warren_wire::{CloseReason, Frame, Method, MethodKind};

#[tokio::test]
async fn local_close_records_normal_shutdown_and_cascades() {
    support::init_tracing();
    let (client_io, mut peer_io) = pair(64);
    let peer = tokio::spawn(async move {
        serve_handshake(&mut peer_io).await;
        serve_close(&mut peer_io).await;
    });

    let (handle, driver) = establish(client_io, ConnectionConfig::default(), NoEvents)
        .await
        .unwrap();
    let driver = tokio::spawn(driver.run());

    let channel = handle.open_channel().await.unwrap();

    handle.close().await.unwrap();
    peer.await.unwrap();
    driver.await.unwrap().unwrap();

    let reason = handle.close_reason().unwrap();
    assert_eq!(reason.code, 200);
    assert_eq!(reason.text, "Normal shutdown");

    // The identical reason object reached the channel.
    let channel_reason = channel.close_reason().unwrap();
    assert!(Arc::ptr_eq(&reason, &channel_reason));

    // Everything now fails deterministically with the original reason.
    let err = channel
        .call(Method::ChannelOpen, &[MethodKind::ChannelOpenOk])
        .await
        .unwrap_err();
    assert_eq!(err, CallError::ConnectionClosed(reason.clone()));
    let err = handle.open_channel().await.unwrap_err();
    assert_eq!(err, CallError::ConnectionClosed(reason));

    // Closing again is a successful no-op.
    handle.close().await.unwrap();
}

#[tokio::test]
async fn peer_close_fails_pending_calls_and_is_acknowledged() {
    let (client_io, mut peer_io) = pair(64);
    let peer = tokio::spawn(async move {
        serve_handshake(&mut peer_io).await;

        // The client parks a call on channel 1; close instead of answering.
        let open = expect_frame(&mut peer_io).await;
        assert_eq!(open.channel(), 1);
        peer_io
            .send(&Frame::Method {
                channel: 0,
                method: Method::ConnectionClose {
                    reply_code: 320,
                    reply_text: "CONNECTION_FORCED".to_string(),
                    class_id: 0,
                    method_id: 0,
                },
            })
            .await
            .unwrap();

        let close_ok = expect_frame(&mut peer_io).await;
        assert_eq!(
            close_ok,
            Frame::Method {
                channel: 0,
                method: Method::ConnectionCloseOk
            }
        );
    });

    let (handle, driver) = establish(client_io, ConnectionConfig::default(), NoEvents)
        .await
        .unwrap();
    let driver = tokio::spawn(driver.run());

    let channel = handle.open_channel().await.unwrap();
    let err = channel
        .call(Method::ChannelOpen, &[MethodKind::ChannelOpenOk])
        .await
        .unwrap_err();

    let reason = handle.close_reason().unwrap();
    assert_eq!(reason.code, 320);
    assert_eq!(reason.text, "CONNECTION_FORCED");
    assert_eq!(err, CallError::ConnectionClosed(reason.clone()));
    assert!(Arc::ptr_eq(&channel.close_reason().unwrap(), &reason));

    peer.await.unwrap();
    driver.await.unwrap().unwrap();
}

#[tokio::test]
async fn transport_loss_synthesizes_a_socket_closed_reason() {
    let (client_io, mut peer_io) = pair(64);
    let peer = tokio::spawn(async move {
        serve_handshake(&mut peer_io).await;
        // Hang up without a close handshake.
        drop(peer_io);
    });

    let (handle, driver) = establish(client_io, ConnectionConfig::default(), NoEvents)
        .await
        .unwrap();
    let driver = tokio::spawn(driver.run());

    peer.await.unwrap();
    // Orderly peer disconnect at the byte level: the driver exits cleanly
    // after cascading the synthesized reason.
    driver.await.unwrap().unwrap();

    let reason = handle.close_reason().unwrap();
    assert_eq!(reason.code, 0);
    assert_eq!(reason.text, "Socket closed");

    let err = handle.open_channel().await.unwrap_err();
    assert_eq!(err, CallError::ConnectionClosed(reason));
}

#[tokio::test]
async fn released_channel_numbers_become_available_again() {
    let (client_io, mut peer_io) = pair(64);
    let peer = tokio::spawn(async move {
        serve_handshake(&mut peer_io).await;
        serve_close(&mut peer_io).await;
    });

    let (handle, driver) = establish(client_io, ConnectionConfig::default(), NoEvents)
        .await
        .unwrap();
    let driver = tokio::spawn(driver.run());

    let first = handle.open_channel().await.unwrap();
    let first_number = first.number();
    first.release().await.unwrap();

    let second = handle.open_channel().await.unwrap();
    assert_ne!(second.number(), 0);
    // The cursor moves forward, so the released number is not reused while
    // other numbers remain free.
    assert_ne!(second.number(), first_number);

    handle.close().await.unwrap();
    peer.await.unwrap();
    driver.await.unwrap().unwrap();
}

struct RecordingEvents {
    opened: Arc<AtomicBool>,
    closed: Arc<Mutex<Option<CloseReason>>>,
}

impl ConnectionEvents for RecordingEvents {
    fn on_open(&mut self) {
        self.opened.store(true, Ordering::SeqCst);
    }

    fn on_closed(&mut self, reason: &CloseReason) {
        *self.closed.lock().unwrap() = Some(reason.clone());
    }
}

#[tokio::test]
async fn lifecycle_hooks_fire_on_open_and_peer_close() {
    let (client_io, mut peer_io) = pair(64);
    let peer = tokio::spawn(async move {
        serve_handshake(&mut peer_io).await;
        peer_io
            .send(&Frame::Method {
                channel: 0,
                method: Method::ConnectionClose {
                    reply_code: 320,
                    reply_text: "CONNECTION_FORCED".to_string(),
                    class_id: 0,
                    method_id: 0,
                },
            })
            .await
            .unwrap();
        let _close_ok = expect_frame(&mut peer_io).await;
    });

    let opened = Arc::new(AtomicBool::new(false));
    let closed = Arc::new(Mutex::new(None));
    let events = RecordingEvents {
        opened: opened.clone(),
        closed: closed.clone(),
    };

    let (_handle, driver) = establish(client_io, ConnectionConfig::default(), events)
        .await
        .unwrap();
    assert!(opened.load(Ordering::SeqCst));

    driver.run().await.unwrap();
    peer.await.unwrap();

    let recorded = closed.lock().unwrap().clone().unwrap();
    assert_eq!(recorded.code, 320);
    assert_eq!(recorded.text, "CONNECTION_FORCED");
}
