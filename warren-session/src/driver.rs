//! Connection driver and application-facing handles.
//!
//! The driver task owns every piece of mutable connection state: the channel
//! table, the outstanding-call queues, and the transport. Handles are cheap
//! clones that funnel commands to it over an mpsc channel and await replies
//! on per-command oneshots, so all mutation is serialized without locks and
//! inbound frames are dispatched strictly in arrival order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use warren_wire::{
    reply_code, ChannelId, CloseReason, Frame, Method, MethodKind, CONTROL_CHANNEL,
};

use crate::channel::{ChannelEvent, ChannelState, ChannelTable, CloseCell, PendingRpc};
use crate::errors::{CallError, ConnectionError};
use crate::outbound::{content_frames, Content};
use crate::transport::FrameTransport;
use crate::tuning::TuningParams;

pub(crate) const COMMAND_BUFFER: usize = 64;
pub(crate) const EVENT_BUFFER: usize = 256;

/// Lifecycle hooks invoked by the connection core.
///
/// Injected at [`establish`](crate::establish); both hooks default to no-ops.
pub trait ConnectionEvents: Send {
    /// The server acknowledged the virtual-host open.
    fn on_open(&mut self) {}

    /// The peer closed the connection.
    fn on_closed(&mut self, reason: &CloseReason) {
        let _ = reason;
    }
}

/// Hook implementation that does nothing.
pub struct NoEvents;

impl ConnectionEvents for NoEvents {}

/// Requests travelling from handles to the driver task.
pub(crate) enum Command {
    Call {
        channel: ChannelId,
        method: Method,
        acceptable: Vec<MethodKind>,
        reply: oneshot::Sender<Result<Method, CallError>>,
    },
    Send {
        channel: ChannelId,
        method: Method,
        content: Option<Content>,
        done: oneshot::Sender<Result<(), CallError>>,
    },
    Subscribe {
        channel: ChannelId,
        kind: MethodKind,
        done: oneshot::Sender<Result<(), CallError>>,
    },
    OpenChannel {
        reply: oneshot::Sender<Result<ChannelHandle, CallError>>,
    },
    ReleaseChannel {
        channel: ChannelId,
        done: oneshot::Sender<Result<(), CallError>>,
    },
    Close {
        done: oneshot::Sender<Result<(), CallError>>,
    },
}

/// Whether the driver loop keeps running after a step.
enum Flow {
    Continue,
    Exit,
}

/// The error for operations on a channel number no longer in the table.
fn released_channel_error() -> CallError {
    CallError::ChannelClosed(Arc::new(CloseReason::new(0, "channel released")))
}

/// The connection's single owning task.
///
/// Returned by [`establish`](crate::establish) with the handshake already
/// complete; must be spawned (or awaited) for the connection to make
/// progress. Runs until the connection closes.
pub struct Driver<T, E = NoEvents> {
    io: T,
    events: E,
    negotiated: TuningParams,
    open: bool,
    table: ChannelTable,
    commands_rx: mpsc::Receiver<Command>,
    /// Weak so that dropping every handle closes the command channel, which
    /// the run loop treats as a graceful close request.
    commands_tx: mpsc::WeakSender<Command>,
}

impl<T, E> std::fmt::Debug for Driver<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("open", &self.open)
            .field("negotiated", &self.negotiated)
            .finish_non_exhaustive()
    }
}

impl<T, E> Driver<T, E>
where
    T: FrameTransport,
    E: ConnectionEvents,
{
    pub(crate) fn new(
        io: T,
        events: E,
        negotiated: TuningParams,
        table: ChannelTable,
        commands_tx: mpsc::WeakSender<Command>,
        commands_rx: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            io,
            events,
            negotiated,
            open: true,
            table,
            commands_rx,
            commands_tx,
        }
    }

    /// Run the driver until the connection closes.
    ///
    /// Returns `Ok(())` on an orderly shutdown (local or peer-initiated) and
    /// an error on transport failure or protocol violation. Either way the
    /// close reason has been cascaded to every channel before returning.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                biased;

                frame = self.io.recv() => match frame {
                    Ok(Some(frame)) => {
                        if let Flow::Exit = self.handle_frame(frame).await? {
                            return Ok(());
                        }
                    }
                    Ok(None) => return self.transport_lost(None).await,
                    Err(e) => return self.transport_lost(Some(e)).await,
                },

                command = self.commands_rx.recv() => match command {
                    Some(command) => {
                        if let Flow::Exit = self.handle_command(command).await? {
                            return Ok(());
                        }
                    }
                    // Every handle is gone; nothing can reach this connection
                    // any more, so shut it down gracefully.
                    None => return self.close_locally(None).await,
                },
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    async fn handle_frame(&mut self, frame: Frame) -> Result<Flow, ConnectionError> {
        trace!(?frame, "inbound frame");
        let channel = frame.channel();
        if channel == CONTROL_CHANNEL {
            return self.handle_control_frame(frame).await;
        }
        match self.table.route(frame) {
            Ok(()) => Ok(Flow::Continue),
            Err(context) => self.protocol_violation(channel, context).await,
        }
    }

    async fn handle_control_frame(&mut self, frame: Frame) -> Result<Flow, ConnectionError> {
        match frame {
            // The sole liveness mechanism: echo heartbeats back verbatim.
            Frame::Heartbeat { .. } => {
                self.io.send(&frame).await?;
                Ok(Flow::Continue)
            }
            Frame::Method {
                method:
                    Method::ConnectionClose {
                        reply_code,
                        reply_text,
                        class_id,
                        method_id,
                    },
                ..
            } => {
                let reason = Arc::new(CloseReason {
                    code: reply_code,
                    text: reply_text,
                    class_id,
                    method_id,
                });
                self.peer_closed(reason).await
            }
            Frame::Method { .. } => match self.table.route(frame) {
                Ok(()) => Ok(Flow::Continue),
                Err(context) => self.protocol_violation(CONTROL_CHANNEL, context).await,
            },
            Frame::ContentHeader { .. } | Frame::ContentBody { .. } => {
                self.protocol_violation(
                    CONTROL_CHANNEL,
                    "content frame on the control channel".to_string(),
                )
                .await
            }
            Frame::ProtocolHeader(_) => {
                self.protocol_violation(
                    CONTROL_CHANNEL,
                    "protocol header after handshake".to_string(),
                )
                .await
            }
        }
    }

    async fn peer_closed(&mut self, reason: Arc<CloseReason>) -> Result<Flow, ConnectionError> {
        debug!(reason = %reason, "peer closed the connection");
        self.table.cascade(reason.clone());
        self.open = false;

        // Acknowledge; the peer may already be gone.
        let close_ok = Frame::Method {
            channel: CONTROL_CHANNEL,
            method: Method::ConnectionCloseOk,
        };
        if let Err(e) = self.io.send(&close_ok).await {
            debug!(error = %e, "close acknowledgement not delivered");
        }
        self.events.on_closed(&reason);
        let _ = self.io.shutdown().await;
        Ok(Flow::Exit)
    }

    /// Escalate an unroutable or unacceptable frame: fatal to the connection.
    async fn protocol_violation(
        &mut self,
        channel: ChannelId,
        context: String,
    ) -> Result<Flow, ConnectionError> {
        warn!(channel, context = %context, "protocol violation");
        let reason = Arc::new(CloseReason::unexpected_frame());
        self.table.cascade(reason.clone());
        self.open = false;

        // Tell the peer why, best-effort, without waiting for the ack.
        let close = Frame::Method {
            channel: CONTROL_CHANNEL,
            method: Method::ConnectionClose {
                reply_code: reason.code,
                reply_text: reason.text.clone(),
                class_id: 0,
                method_id: 0,
            },
        };
        let _ = self.io.send(&close).await;
        let _ = self.io.shutdown().await;
        Err(ConnectionError::UnexpectedFrame { channel, context })
    }

    /// The byte stream died underneath us: synthesize a close reason, cascade,
    /// and run a best-effort close cycle.
    async fn transport_lost(
        &mut self,
        error: Option<std::io::Error>,
    ) -> Result<(), ConnectionError> {
        debug!(error = ?error, "transport lost");
        self.table.cascade(Arc::new(CloseReason::socket_closed()));
        if self.open {
            self.open = false;
            let close = Frame::Method {
                channel: CONTROL_CHANNEL,
                method: Method::ConnectionClose {
                    reply_code: reply_code::REPLY_SUCCESS,
                    reply_text: "Normal shutdown".to_string(),
                    class_id: 0,
                    method_id: 0,
                },
            };
            let _ = self.io.send(&close).await;
        }
        let _ = self.io.shutdown().await;
        match error {
            Some(e) => Err(ConnectionError::Io(e)),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) -> Result<Flow, ConnectionError> {
        match command {
            Command::Call {
                channel,
                method,
                acceptable,
                reply,
            } => {
                match self.ensure_channel(channel) {
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                    Ok(()) => {
                        self.send_frames(&[Frame::Method { channel, method }]).await?;
                        if let Some(state) = self.table.get_mut(channel) {
                            state.push_pending(PendingRpc { acceptable, reply });
                        }
                    }
                }
                Ok(Flow::Continue)
            }
            Command::Send {
                channel,
                method,
                content,
                done,
            } => {
                match self.ensure_channel(channel) {
                    Err(err) => {
                        let _ = done.send(Err(err));
                    }
                    Ok(()) => {
                        let frames =
                            content_frames(channel, method, content, self.negotiated.frame_max);
                        self.send_frames(&frames).await?;
                        let _ = done.send(Ok(()));
                    }
                }
                Ok(Flow::Continue)
            }
            Command::Subscribe {
                channel,
                kind,
                done,
            } => {
                let result = match self.table.get_mut(channel) {
                    Some(state) => {
                        state.subscribe(kind);
                        Ok(())
                    }
                    None => Err(released_channel_error()),
                };
                let _ = done.send(result);
                Ok(Flow::Continue)
            }
            Command::OpenChannel { reply } => {
                let _ = reply.send(self.open_channel());
                Ok(Flow::Continue)
            }
            Command::ReleaseChannel { channel, done } => {
                let reason = Arc::new(CloseReason::new(0, "channel released"));
                if let Some(mut state) = self.table.deallocate(channel) {
                    state.close(reason.clone(), CallError::ChannelClosed(reason));
                    debug!(channel, "channel released");
                }
                let _ = done.send(Ok(()));
                Ok(Flow::Continue)
            }
            Command::Close { done } => {
                self.close_locally(Some(done)).await?;
                Ok(Flow::Exit)
            }
        }
    }

    /// Validity check performed before any RPC or send: a recorded close
    /// reason fails the operation immediately, without sending anything.
    fn ensure_channel(&mut self, channel: ChannelId) -> Result<(), CallError> {
        if let Some(reason) = self.table.connection_close().reason() {
            return Err(CallError::ConnectionClosed(reason));
        }
        let Some(state) = self.table.get_mut(channel) else {
            return Err(released_channel_error());
        };
        match state.close.reason() {
            Some(reason) => Err(CallError::ChannelClosed(reason)),
            None => Ok(()),
        }
    }

    fn open_channel(&mut self) -> Result<ChannelHandle, CallError> {
        if let Some(reason) = self.table.connection_close().reason() {
            return Err(CallError::ConnectionClosed(reason));
        }
        // A handle is asking, so a strong sender necessarily still exists.
        let Some(commands) = self.commands_tx.upgrade() else {
            return Err(CallError::DriverGone);
        };
        let number = self.table.allocate(self.negotiated.channel_limit())?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let state = ChannelState::new(number, events_tx);
        let close = state.close.clone();
        self.table.register(state);
        debug!(channel = number, "channel allocated");
        Ok(ChannelHandle {
            number,
            commands,
            close,
            connection_close: self.table.connection_close().clone(),
            events: events_rx,
        })
    }

    /// Send a whole submission; a transport error here is fatal and recorded
    /// as a socket close before propagating.
    async fn send_frames(&mut self, frames: &[Frame]) -> Result<(), ConnectionError> {
        if let Err(e) = self.io.send_all(frames).await {
            self.table.cascade(Arc::new(CloseReason::socket_closed()));
            self.open = false;
            return Err(ConnectionError::Io(e));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local close
    // ------------------------------------------------------------------

    /// Graceful local shutdown: close RPC on channel 0, cascade, transport
    /// teardown. Idempotent — a second close is a successful no-op.
    async fn close_locally(
        &mut self,
        done: Option<oneshot::Sender<Result<(), CallError>>>,
    ) -> Result<(), ConnectionError> {
        if !self.open {
            if let Some(done) = done {
                let _ = done.send(Ok(()));
            }
            return Ok(());
        }
        self.open = false;
        debug!("closing connection");

        let close = Frame::Method {
            channel: CONTROL_CHANNEL,
            method: Method::ConnectionClose {
                reply_code: reply_code::REPLY_SUCCESS,
                reply_text: "Normal shutdown".to_string(),
                class_id: 0,
                method_id: 0,
            },
        };
        if let Err(e) = self.io.send(&close).await {
            self.table.cascade(Arc::new(CloseReason::socket_closed()));
            let _ = self.io.shutdown().await;
            if let Some(done) = done {
                let _ = done.send(Ok(()));
            }
            return Err(ConnectionError::Io(e));
        }

        // Wait for the acknowledgement. Once closed, nothing but the close
        // handshake is accepted: heartbeats are echoed, everything else is
        // discarded.
        loop {
            match self.io.recv().await {
                Ok(Some(Frame::Heartbeat { channel })) if channel == CONTROL_CHANNEL => {
                    let _ = self.io.send(&Frame::Heartbeat { channel }).await;
                }
                Ok(Some(Frame::Method {
                    method: Method::ConnectionCloseOk,
                    ..
                })) => {
                    self.table.cascade(Arc::new(CloseReason::normal()));
                    break;
                }
                Ok(Some(Frame::Method {
                    method: Method::ConnectionClose { .. },
                    ..
                })) => {
                    // The peer was closing at the same time. Our close was
                    // triggered first locally; acknowledge theirs and finish.
                    let close_ok = Frame::Method {
                        channel: CONTROL_CHANNEL,
                        method: Method::ConnectionCloseOk,
                    };
                    let _ = self.io.send(&close_ok).await;
                    self.table.cascade(Arc::new(CloseReason::normal()));
                    break;
                }
                Ok(Some(other)) => {
                    trace!(frame = ?other, "frame discarded during close handshake");
                }
                Ok(None) | Err(_) => {
                    self.table.cascade(Arc::new(CloseReason::socket_closed()));
                    break;
                }
            }
        }

        let _ = self.io.shutdown().await;
        if let Some(done) = done {
            let _ = done.send(Ok(()));
        }
        Ok(())
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Handle for connection-level operations.
///
/// Cloneable; all clones talk to the same driver task. Operations fail
/// deterministically with the recorded close reason once the connection is
/// closed.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    close: CloseCell,
    negotiated: TuningParams,
    known_hosts: Arc<str>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<Command>,
        close: CloseCell,
        negotiated: TuningParams,
        known_hosts: Arc<str>,
    ) -> Self {
        Self {
            commands,
            close,
            negotiated,
            known_hosts,
        }
    }

    /// Allocate a channel number and return its application-facing handle.
    pub async fn open_channel(&self) -> Result<ChannelHandle, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::OpenChannel { reply: reply_tx })
            .await
            .map_err(|_| self.gone())?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.gone()),
        }
    }

    /// Initiate graceful shutdown and wait until it completes.
    ///
    /// Closing an already-closed connection succeeds.
    pub async fn close(&self) -> Result<(), CallError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Close { done: done_tx })
            .await
            .is_err()
        {
            // Driver already exited; if a reason was recorded the connection
            // is closed, which is what the caller asked for.
            return if self.close.is_closed() {
                Ok(())
            } else {
                Err(CallError::DriverGone)
            };
        }
        match done_rx.await {
            Ok(result) => result,
            Err(_) => {
                if self.close.is_closed() {
                    Ok(())
                } else {
                    Err(CallError::DriverGone)
                }
            }
        }
    }

    /// The limits agreed during the handshake.
    pub fn negotiated(&self) -> TuningParams {
        self.negotiated
    }

    /// The `known_hosts` list the server sent in its open acknowledgement.
    /// Surfaced for the application; this core never redirects.
    pub fn known_hosts(&self) -> &str {
        &self.known_hosts
    }

    /// The recorded close reason, if the connection has one.
    pub fn close_reason(&self) -> Option<Arc<CloseReason>> {
        self.close.reason()
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    fn gone(&self) -> CallError {
        match self.close.reason() {
            Some(reason) => CallError::ConnectionClosed(reason),
            None => CallError::DriverGone,
        }
    }
}

/// Handle for one logical channel.
///
/// Obtained from [`ConnectionHandle::open_channel`]. Carries the channel's
/// event stream, so it is not cloneable; the sending operations go through
/// the shared driver task.
#[derive(Debug)]
pub struct ChannelHandle {
    number: ChannelId,
    commands: mpsc::Sender<Command>,
    close: CloseCell,
    connection_close: CloseCell,
    events: mpsc::Receiver<ChannelEvent>,
}

impl ChannelHandle {
    pub fn number(&self) -> ChannelId {
        self.number
    }

    /// Issue a method and wait until a reply whose kind is in `acceptable`
    /// arrives on this channel, or the channel/connection closes.
    pub async fn call(
        &self,
        method: Method,
        acceptable: &[MethodKind],
    ) -> Result<Method, CallError> {
        self.ensure_usable()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Call {
                channel: self.number,
                method,
                acceptable: acceptable.to_vec(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.gone())?;
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.gone()),
        }
    }

    /// Send a method, optionally with content, without waiting for a reply.
    ///
    /// Resolves once the whole submission has been enqueued on the transport.
    pub async fn send(&self, method: Method, content: Option<Content>) -> Result<(), CallError> {
        self.ensure_usable()?;
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                channel: self.number,
                method,
                content,
                done: done_tx,
            })
            .await
            .map_err(|_| self.gone())?;
        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.gone()),
        }
    }

    /// Subscribe this channel to an asynchronous notification method.
    /// Matching inbound methods are delivered via [`ChannelHandle::next_event`].
    pub async fn subscribe(&self, kind: MethodKind) -> Result<(), CallError> {
        self.ensure_usable()?;
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                channel: self.number,
                kind,
                done: done_tx,
            })
            .await
            .map_err(|_| self.gone())?;
        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(self.gone()),
        }
    }

    /// Next inbound event for this channel: a subscribed notification method
    /// or a piece of content. `None` once the channel can produce no more.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// Deallocate this channel's number so it can be reused.
    pub async fn release(self) -> Result<(), CallError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::ReleaseChannel {
                channel: self.number,
                done: done_tx,
            })
            .await
            .is_err()
        {
            // Driver gone: the table went with it.
            return Ok(());
        }
        match done_rx.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }

    /// The recorded close reason, if this channel has one.
    pub fn close_reason(&self) -> Option<Arc<CloseReason>> {
        self.close.reason()
    }

    fn ensure_usable(&self) -> Result<(), CallError> {
        if let Some(reason) = self.connection_close.reason() {
            return Err(CallError::ConnectionClosed(reason));
        }
        if let Some(reason) = self.close.reason() {
            return Err(CallError::ChannelClosed(reason));
        }
        Ok(())
    }

    fn gone(&self) -> CallError {
        if let Some(reason) = self.connection_close.reason() {
            return CallError::ConnectionClosed(reason);
        }
        match self.close.reason() {
            Some(reason) => CallError::ChannelClosed(reason),
            None => CallError::DriverGone,
        }
    }
}
