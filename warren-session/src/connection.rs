//! Connection establishment: the handshake sequence.
//!
//! Phases, in order: protocol header exchange, start/start-ok
//! (authentication), tune/tune-ok (limit negotiation), then the synchronous
//! virtual-host open. Control returns to the caller only once the server has
//! acknowledged the open, so no content can ever be produced against
//! un-negotiated limits.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};
use warren_wire::{CloseReason, Frame, Method, CONTROL_CHANNEL, PROTOCOL_VERSION};

use crate::channel::{ChannelState, ChannelTable, CloseCell};
use crate::config::ConnectionConfig;
use crate::driver::{Command, ConnectionEvents, ConnectionHandle, Driver, COMMAND_BUFFER};
use crate::errors::ConnectionError;
use crate::transport::FrameTransport;
use crate::tuning::TuningParams;

/// Establish a connection over `io`: run the whole handshake, then hand back
/// a [`ConnectionHandle`] and the [`Driver`] that must be spawned to pump it.
///
/// Handshake errors are fatal and never retried here; reconnection policy
/// belongs to the caller.
///
/// # Example
///
/// ```ignore
/// let (handle, driver) = establish(transport, ConnectionConfig::default(), NoEvents).await?;
/// tokio::spawn(driver.run());
/// ```
pub async fn establish<T, E>(
    mut io: T,
    config: ConnectionConfig,
    mut events: E,
) -> Result<(ConnectionHandle, Driver<T, E>), ConnectionError>
where
    T: FrameTransport,
    E: ConnectionEvents,
{
    let ConnectionConfig {
        virtual_host,
        credentials,
        tuning,
        client_properties,
    } = config;

    io.send(&Frame::ProtocolHeader(PROTOCOL_VERSION)).await?;

    // Phase 1: the peer declares its supported authentication mechanisms.
    let (mechanisms, locales) = match recv_frame(&mut io).await? {
        Frame::ProtocolHeader(theirs) => {
            return Err(ConnectionError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs,
            });
        }
        Frame::Method {
            channel: CONTROL_CHANNEL,
            method:
                Method::ConnectionStart {
                    mechanisms,
                    locales,
                    ..
                },
        } => (mechanisms, locales),
        other => {
            return Err(unexpected(&other, "expected connection start"));
        }
    };
    trace!(mechanisms = %mechanisms, "start received");

    let Some((mechanism, response)) = credentials.response_for(&mechanisms) else {
        return Err(ConnectionError::NoUsableAuthMechanism { mechanisms });
    };
    let locale = locales
        .split_whitespace()
        .next()
        .unwrap_or("en_US")
        .to_string();
    io.send(&Frame::Method {
        channel: CONTROL_CHANNEL,
        method: Method::ConnectionStartOk {
            client_properties,
            mechanism,
            response,
            locale,
        },
    })
    .await?;
    // The credentials must not remain reachable past authentication.
    drop(credentials);

    // Phase 2: combine the peer's offered limits with ours.
    let offered = match recv_frame(&mut io).await? {
        Frame::Method {
            channel: CONTROL_CHANNEL,
            method:
                Method::ConnectionTune {
                    channel_max,
                    frame_max,
                    heartbeat,
                },
        } => TuningParams {
            channel_max,
            frame_max,
            heartbeat,
        },
        other => {
            return Err(unexpected(&other, "expected connection tune"));
        }
    };
    let negotiated = tuning.negotiate(&offered);
    debug!(
        channel_max = negotiated.channel_max,
        frame_max = negotiated.frame_max,
        heartbeat = negotiated.heartbeat,
        "tuning negotiated"
    );
    io.send(&Frame::Method {
        channel: CONTROL_CHANNEL,
        method: Method::ConnectionTuneOk {
            channel_max: negotiated.channel_max,
            frame_max: negotiated.frame_max,
            heartbeat: negotiated.heartbeat,
        },
    })
    .await?;

    // Steady-state structures, with channel 0's control subscriptions
    // installed before any further traffic.
    let connection_close = CloseCell::new();
    let mut table = ChannelTable::new(connection_close.clone());
    table.register(ChannelState::control());

    // Phase 3: synchronous virtual-host open. Heartbeats are echoed while we
    // wait; anything else before the acknowledgement is a protocol error.
    io.send(&Frame::Method {
        channel: CONTROL_CHANNEL,
        method: Method::ConnectionOpen {
            virtual_host: virtual_host.clone(),
            insist: true,
        },
    })
    .await?;
    let known_hosts = loop {
        match recv_frame(&mut io).await? {
            Frame::Heartbeat {
                channel: CONTROL_CHANNEL,
            } => {
                io.send(&Frame::Heartbeat {
                    channel: CONTROL_CHANNEL,
                })
                .await?;
            }
            Frame::Method {
                channel: CONTROL_CHANNEL,
                method: Method::ConnectionOpenOk { known_hosts },
            } => break known_hosts,
            Frame::Method {
                channel: CONTROL_CHANNEL,
                method:
                    Method::ConnectionClose {
                        reply_code,
                        reply_text,
                        class_id,
                        method_id,
                    },
            } => {
                // The server refused the open (bad vhost, access denied, ...).
                let _ = io
                    .send(&Frame::Method {
                        channel: CONTROL_CHANNEL,
                        method: Method::ConnectionCloseOk,
                    })
                    .await;
                return Err(ConnectionError::Refused(CloseReason {
                    code: reply_code,
                    text: reply_text,
                    class_id,
                    method_id,
                }));
            }
            other => {
                return Err(unexpected(&other, "expected open acknowledgement"));
            }
        }
    };
    debug!(virtual_host = %virtual_host, "connection open");
    events.on_open();

    let (commands_tx, commands_rx) = mpsc::channel::<Command>(COMMAND_BUFFER);
    let handle = ConnectionHandle::new(
        commands_tx.clone(),
        connection_close,
        negotiated,
        Arc::from(known_hosts),
    );
    let driver = Driver::new(
        io,
        events,
        negotiated,
        table,
        commands_tx.downgrade(),
        commands_rx,
    );
    Ok((handle, driver))
}

async fn recv_frame<T: FrameTransport>(io: &mut T) -> Result<Frame, ConnectionError> {
    match io.recv().await? {
        Some(frame) => Ok(frame),
        None => Err(ConnectionError::Closed),
    }
}

fn unexpected(frame: &Frame, context: &str) -> ConnectionError {
    ConnectionError::UnexpectedFrame {
        channel: frame.channel(),
        context: format!("{context}, got {frame:?}"),
    }
}
