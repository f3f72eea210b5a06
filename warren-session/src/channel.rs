//! Channel table, number allocation, and per-channel dispatch state.
//!
//! The table owns every channel's state and is itself owned by the driver
//! task, so none of this needs locking. Close reasons live in set-once cells
//! shared with the application-facing handles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;
use warren_wire::{ChannelId, CloseReason, ContentProperties, Frame, Method, MethodKind};

use crate::errors::CallError;

/// A set-once close reason, shared between the driver's state and every
/// handle that needs to observe it.
///
/// The first reason recorded wins; later attempts are no-ops. Cloning the
/// cell shares the underlying slot, and the reason itself is shared by `Arc`
/// so every observer sees the identical object.
#[derive(Debug, Clone, Default)]
pub struct CloseCell {
    inner: Arc<OnceLock<Arc<CloseReason>>>,
}

impl CloseCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a close reason unless one is already set.
    ///
    /// Returns `true` if this call recorded the reason.
    pub fn close(&self, reason: Arc<CloseReason>) -> bool {
        self.inner.set(reason).is_ok()
    }

    /// The recorded reason, if any.
    pub fn reason(&self) -> Option<Arc<CloseReason>> {
        self.inner.get().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.get().is_some()
    }
}

/// Inbound traffic delivered to a channel's application handle.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A subscribed asynchronous notification method.
    Method(Method),
    /// Start of a content body.
    ContentHeader {
        body_size: u64,
        properties: ContentProperties,
    },
    /// One piece of a content body, in order.
    ContentBody(Bytes),
}

/// An outstanding synchronous call: the set of acceptable reply kinds and the
/// waiting caller.
pub(crate) struct PendingRpc {
    pub(crate) acceptable: Vec<MethodKind>,
    pub(crate) reply: oneshot::Sender<Result<Method, CallError>>,
}

/// Driver-side state for one channel.
pub(crate) struct ChannelState {
    number: ChannelId,
    pub(crate) close: CloseCell,
    subscriptions: HashSet<MethodKind>,
    pending: VecDeque<PendingRpc>,
    /// Delivery path to the application handle. The control channel has none.
    events: Option<mpsc::Sender<ChannelEvent>>,
}

impl ChannelState {
    pub(crate) fn new(number: ChannelId, events: mpsc::Sender<ChannelEvent>) -> Self {
        Self {
            number,
            close: CloseCell::new(),
            subscriptions: HashSet::new(),
            pending: VecDeque::new(),
            events: Some(events),
        }
    }

    /// State for channel 0, with the connection-close subscription installed.
    ///
    /// Frames hitting this subscription are intercepted by the driver before
    /// table routing, so no event channel is attached.
    pub(crate) fn control() -> Self {
        let mut subscriptions = HashSet::new();
        subscriptions.insert(MethodKind::ConnectionClose);
        Self {
            number: warren_wire::CONTROL_CHANNEL,
            close: CloseCell::new(),
            subscriptions,
            pending: VecDeque::new(),
            events: None,
        }
    }

    pub(crate) fn subscribe(&mut self, kind: MethodKind) {
        self.subscriptions.insert(kind);
    }

    pub(crate) fn push_pending(&mut self, pending: PendingRpc) {
        self.pending.push_back(pending);
    }

    /// Dispatch one inbound frame for this channel.
    ///
    /// A method frame resolves the front outstanding call when its kind is in
    /// that call's acceptable set; otherwise it must match a subscription.
    /// Anything else is a protocol violation and is returned as an error for
    /// the driver to escalate — frames are never silently dropped.
    pub(crate) fn dispatch(&mut self, frame: Frame) -> Result<(), String> {
        match frame {
            Frame::Method { method, .. } => {
                let kind = method.kind();
                let resolves_front = self
                    .pending
                    .front()
                    .is_some_and(|call| call.acceptable.contains(&kind));
                if resolves_front {
                    if let Some(call) = self.pending.pop_front() {
                        // The caller may have given up on the reply.
                        let _ = call.reply.send(Ok(method));
                    }
                    return Ok(());
                }
                if self.subscriptions.contains(&kind) {
                    self.deliver(ChannelEvent::Method(method));
                    return Ok(());
                }
                if self.pending.front().is_some() {
                    Err(format!(
                        "reply {kind} is not in the acceptable set of the outstanding call"
                    ))
                } else {
                    Err(format!("unsolicited method {kind} with no subscription"))
                }
            }
            Frame::ContentHeader {
                body_size,
                properties,
                ..
            } => {
                self.deliver(ChannelEvent::ContentHeader {
                    body_size,
                    properties,
                });
                Ok(())
            }
            Frame::ContentBody { payload, .. } => {
                self.deliver(ChannelEvent::ContentBody(payload));
                Ok(())
            }
            Frame::Heartbeat { .. } => Err("heartbeat outside the control channel".to_string()),
            Frame::ProtocolHeader(_) => Err("protocol header after handshake".to_string()),
        }
    }

    fn deliver(&mut self, event: ChannelEvent) {
        let Some(events) = &self.events else {
            warn!(channel = self.number, ?event, "event on control channel dropped");
            return;
        };
        if let Err(e) = events.try_send(event) {
            warn!(channel = self.number, error = %e, "channel event dropped");
        }
    }

    /// Fail every outstanding call on this channel.
    pub(crate) fn fail_pending(&mut self, err: &CallError) {
        for call in self.pending.drain(..) {
            let _ = call.reply.send(Err(err.clone()));
        }
    }

    /// Record a close reason (first wins) and fail outstanding calls.
    pub(crate) fn close(&mut self, reason: Arc<CloseReason>, err: CallError) {
        self.close.close(reason);
        self.fail_pending(&err);
    }
}

/// Mapping from channel number to channel state, plus number allocation.
pub(crate) struct ChannelTable {
    channels: HashMap<ChannelId, ChannelState>,
    /// Where the next allocation scan starts. Advancing it amortizes repeated
    /// scans and avoids immediate reuse of freshly released numbers.
    cursor: ChannelId,
    connection_close: CloseCell,
}

impl ChannelTable {
    pub(crate) fn new(connection_close: CloseCell) -> Self {
        Self {
            channels: HashMap::new(),
            cursor: 0,
            connection_close,
        }
    }

    pub(crate) fn connection_close(&self) -> &CloseCell {
        &self.connection_close
    }

    /// Find a free channel number in `1..=limit`, scanning upward from the
    /// saved cursor and wrapping. A full cycle without a free slot fails with
    /// [`CallError::NoFreeChannels`].
    pub(crate) fn allocate(&mut self, limit: ChannelId) -> Result<ChannelId, CallError> {
        debug_assert!(limit > 0);
        let mut candidate = self.cursor;
        for _ in 0..limit {
            candidate = if candidate >= limit { 1 } else { candidate + 1 };
            if !self.channels.contains_key(&candidate) {
                self.cursor = candidate;
                return Ok(candidate);
            }
        }
        Err(CallError::NoFreeChannels)
    }

    /// Insert a channel's state. A channel registered while the connection is
    /// already closed is assigned the connection's close reason immediately.
    pub(crate) fn register(&mut self, state: ChannelState) {
        if let Some(reason) = self.connection_close.reason() {
            state.close.close(reason);
        }
        self.channels.insert(state.number, state);
    }

    pub(crate) fn deallocate(&mut self, number: ChannelId) -> Option<ChannelState> {
        self.channels.remove(&number)
    }

    pub(crate) fn get_mut(&mut self, number: ChannelId) -> Option<&mut ChannelState> {
        self.channels.get_mut(&number)
    }

    /// Dispatch an inbound frame to its channel. An unknown channel number is
    /// a protocol error, never a silent drop.
    pub(crate) fn route(&mut self, frame: Frame) -> Result<(), String> {
        let number = frame.channel();
        match self.channels.get_mut(&number) {
            Some(state) => state.dispatch(frame),
            None => Err(format!("no channel {number} registered")),
        }
    }

    /// Record a connection-level close reason and propagate it to every
    /// registered channel, failing their outstanding calls.
    ///
    /// Idempotent: the first reason wins on the connection and on each
    /// channel, so racing close triggers leave one authoritative reason.
    pub(crate) fn cascade(&mut self, reason: Arc<CloseReason>) {
        self.connection_close.close(reason);
        let Some(reason) = self.connection_close.reason() else {
            return;
        };
        let err = CallError::ConnectionClosed(reason.clone());
        for state in self.channels.values_mut() {
            state.close(reason.clone(), err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ChannelTable {
        ChannelTable::new(CloseCell::new())
    }

    fn channel_state(number: ChannelId) -> (ChannelState, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (ChannelState::new(number, tx), rx)
    }

    #[test]
    fn allocation_yields_distinct_nonzero_numbers() {
        let mut table = table();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let number = table.allocate(32767).unwrap();
            assert_ne!(number, 0);
            assert!(number <= 32767);
            assert!(seen.insert(number));
            let (state, _rx) = channel_state(number);
            table.register(state);
        }
    }

    #[test]
    fn allocation_respects_the_limit_and_exhausts() {
        let mut table = table();
        let mut numbers = Vec::new();
        for _ in 0..4 {
            let number = table.allocate(4).unwrap();
            assert!(number >= 1 && number <= 4);
            numbers.push(number);
            let (state, _rx) = channel_state(number);
            table.register(state);
        }
        numbers.sort_unstable();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(table.allocate(4), Err(CallError::NoFreeChannels));
    }

    #[test]
    fn freed_numbers_are_reused_without_stealing_active_ones() {
        let mut table = table();
        for _ in 0..4 {
            let number = table.allocate(4).unwrap();
            let (state, _rx) = channel_state(number);
            table.register(state);
        }
        table.deallocate(2);
        let number = table.allocate(4).unwrap();
        assert_eq!(number, 2);
    }

    #[test]
    fn cursor_avoids_immediate_reuse_while_slots_remain() {
        let mut table = table();
        let first = table.allocate(8).unwrap();
        let (state, _rx) = channel_state(first);
        table.register(state);
        table.deallocate(first);
        // The freed number is skipped while later numbers are still free.
        let second = table.allocate(8).unwrap();
        assert_ne!(second, first);
    }

    #[test]
    fn cascade_shares_one_reason_object_with_every_channel() {
        let mut table = table();
        let mut cells = Vec::new();
        for number in [1u16, 2, 3] {
            let (state, _rx) = channel_state(number);
            cells.push((state.close.clone(), _rx));
            table.register(state);
        }
        let reason = Arc::new(CloseReason::new(320, "CONNECTION_FORCED"));
        table.cascade(reason.clone());

        assert!(table.connection_close().is_closed());
        for (cell, _rx) in &cells {
            let recorded = cell.reason().unwrap();
            assert!(Arc::ptr_eq(&recorded, &reason));
        }
    }

    #[test]
    fn channel_registered_after_close_is_assigned_a_reason_immediately() {
        let mut table = table();
        let reason = Arc::new(CloseReason::socket_closed());
        table.cascade(reason.clone());

        let (state, _rx) = channel_state(9);
        let cell = state.close.clone();
        table.register(state);
        assert!(Arc::ptr_eq(&cell.reason().unwrap(), &reason));
    }

    #[test]
    fn first_close_reason_wins() {
        let mut table = table();
        let (state, _rx) = channel_state(1);
        let cell = state.close.clone();
        table.register(state);

        let first = Arc::new(CloseReason::normal());
        let second = Arc::new(CloseReason::socket_closed());
        table.cascade(first.clone());
        table.cascade(second);

        assert!(Arc::ptr_eq(&table.connection_close().reason().unwrap(), &first));
        assert!(Arc::ptr_eq(&cell.reason().unwrap(), &first));
    }

    #[test]
    fn cascade_fails_outstanding_calls_with_the_reason() {
        let mut table = table();
        let (mut state, _rx) = channel_state(1);
        let (reply_tx, mut reply_rx) = oneshot::channel();
        state.push_pending(PendingRpc {
            acceptable: vec![MethodKind::ChannelCloseOk],
            reply: reply_tx,
        });
        table.register(state);

        let reason = Arc::new(CloseReason::socket_closed());
        table.cascade(reason.clone());

        match reply_rx.try_recv().unwrap() {
            Err(CallError::ConnectionClosed(r)) => assert!(Arc::ptr_eq(&r, &reason)),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn route_to_unknown_channel_fails_loudly() {
        let mut table = table();
        let err = table
            .route(Frame::Method {
                channel: 5,
                method: Method::ChannelOpenOk,
            })
            .unwrap_err();
        assert!(err.contains("no channel 5"));
    }

    #[test]
    fn matching_reply_resolves_the_front_call() {
        let (mut state, _rx) = channel_state(1);
        let (reply_tx, mut reply_rx) = oneshot::channel();
        state.push_pending(PendingRpc {
            acceptable: vec![MethodKind::ChannelOpenOk],
            reply: reply_tx,
        });

        state
            .dispatch(Frame::Method {
                channel: 1,
                method: Method::ChannelOpenOk,
            })
            .unwrap();

        assert_eq!(reply_rx.try_recv().unwrap(), Ok(Method::ChannelOpenOk));
    }

    #[test]
    fn reply_outside_the_acceptable_set_is_an_error() {
        let (mut state, _rx) = channel_state(1);
        let (reply_tx, _reply_rx) = oneshot::channel();
        state.push_pending(PendingRpc {
            acceptable: vec![MethodKind::ChannelOpenOk],
            reply: reply_tx,
        });

        let err = state
            .dispatch(Frame::Method {
                channel: 1,
                method: Method::ChannelCloseOk,
            })
            .unwrap_err();
        assert!(err.contains("acceptable set"));
    }

    #[test]
    fn subscribed_methods_are_delivered_as_events() {
        let (mut state, mut rx) = channel_state(1);
        state.subscribe(MethodKind::ChannelClose);

        state
            .dispatch(Frame::Method {
                channel: 1,
                method: Method::ChannelClose {
                    reply_code: 406,
                    reply_text: "PRECONDITION_FAILED".into(),
                    class_id: 0,
                    method_id: 0,
                },
            })
            .unwrap();

        match rx.try_recv().unwrap() {
            ChannelEvent::Method(Method::ChannelClose { reply_code, .. }) => {
                assert_eq!(reply_code, 406)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn content_frames_flow_to_the_event_stream() {
        let (mut state, mut rx) = channel_state(1);
        state
            .dispatch(Frame::ContentHeader {
                channel: 1,
                body_size: 3,
                properties: ContentProperties::default(),
            })
            .unwrap();
        state
            .dispatch(Frame::ContentBody {
                channel: 1,
                payload: Bytes::from_static(b"abc"),
            })
            .unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            ChannelEvent::ContentHeader { body_size: 3, .. }
        ));
        match rx.try_recv().unwrap() {
            ChannelEvent::ContentBody(payload) => assert_eq!(&payload[..], b"abc"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
