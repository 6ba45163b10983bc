//! Stream handle and close sub-machine.
//!
//! A stream's close state advances on three events: BEFORE_SEND (an
//! end-stream frame is about to reach the socket, so peer reactions to it
//! are valid on arrival), AFTER_SEND (the frame reached the socket), and
//! RECEIVED (the peer's end-stream arrived):
//!
//! ```text
//! NotClosed ──BEFORE_SEND──▶ LocallyClosing ──AFTER_SEND──▶ LocallyClosed
//!     │                          │                              │
//!  RECEIVED                   RECEIVED                       RECEIVED
//!     ▼                          ▼                              ▼
//! RemotelyClosed ─BEFORE_SEND─▶ Closing ──AFTER_SEND──▶      Closed
//! ```
//!
//! Entering `Closing` increments the session's closing counter; reaching
//! `Closed` decrements the stream/closing pair. These transitions are the
//! only mutations of the closing counter.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::api::{StreamListener, WriteFlushListener};
use crate::callback::Callback;
use crate::error::{ErrorCode, SessionError};
use crate::frame::{Frame, ResetFrame};
use crate::session::Session;

/// Stream close states. `Closed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseState {
    NotClosed = 0,
    LocallyClosing = 1,
    LocallyClosed = 2,
    RemotelyClosed = 3,
    Closing = 4,
    Closed = 5,
}

impl CloseState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotClosed,
            1 => Self::LocallyClosing,
            2 => Self::LocallyClosed,
            3 => Self::RemotelyClosed,
            4 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Close-state machine events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseEvent {
    /// An end-stream frame was received from the peer.
    Received,
    /// An end-stream frame is about to be handed to the socket.
    BeforeSend,
    /// An end-stream frame reached the socket.
    AfterSend,
}

/// One HTTP/2 stream. Owned by the session; removal is by the session
/// alone.
pub struct Stream {
    id: u32,
    local: bool,
    send_window: AtomicI32,
    recv_window: AtomicI32,
    close_state: AtomicU8,
    reset: AtomicBool,
    failure: Mutex<Option<SessionError>>,
    listener: Mutex<Option<Arc<dyn StreamListener>>>,
    attachment: Mutex<Option<Arc<dyn WriteFlushListener>>>,
    idle_timeout: Mutex<Duration>,
    active_at: Mutex<Instant>,
}

impl Stream {
    pub(crate) fn new(id: u32, local: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            local,
            // Windows start at zero; the flow control strategy seeds them
            // on creation.
            send_window: AtomicI32::new(0),
            recv_window: AtomicI32::new(0),
            close_state: AtomicU8::new(CloseState::NotClosed as u8),
            reset: AtomicBool::new(false),
            failure: Mutex::new(None),
            listener: Mutex::new(None),
            attachment: Mutex::new(None),
            idle_timeout: Mutex::new(Duration::ZERO),
            active_at: Mutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// True when this side initiated the stream.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn close_state(&self) -> CloseState {
        CloseState::from_u8(self.close_state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.close_state() == CloseState::Closed
    }

    pub fn is_remotely_closed(&self) -> bool {
        matches!(
            self.close_state(),
            CloseState::RemotelyClosed | CloseState::Closing
        )
    }

    pub fn is_locally_closed(&self) -> bool {
        matches!(
            self.close_state(),
            CloseState::LocallyClosed | CloseState::Closing
        )
    }

    pub fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    pub(crate) fn mark_reset(&self) {
        self.reset.store(true, Ordering::Release);
    }

    /// Failure recorded when the stream failed with the session.
    pub fn failure(&self) -> Option<SessionError> {
        self.failure.lock().expect("stream lock").clone()
    }

    // ── Windows ────────────────────────────────────────────────────────

    pub fn send_window(&self) -> i32 {
        self.send_window.load(Ordering::Acquire)
    }

    pub fn recv_window(&self) -> i32 {
        self.recv_window.load(Ordering::Acquire)
    }

    /// Add `delta` to the send window, returning the previous value.
    pub fn update_send_window(&self, delta: i32) -> i32 {
        self.send_window.fetch_add(delta, Ordering::AcqRel)
    }

    /// Add `delta` to the receive window, returning the previous value.
    pub fn update_recv_window(&self, delta: i32) -> i32 {
        self.recv_window.fetch_add(delta, Ordering::AcqRel)
    }

    // ── Listener and attachment ────────────────────────────────────────

    pub fn set_listener(&self, listener: Option<Arc<dyn StreamListener>>) {
        *self.listener.lock().expect("stream lock") = listener;
    }

    pub fn listener(&self) -> Option<Arc<dyn StreamListener>> {
        self.listener.lock().expect("stream lock").clone()
    }

    /// Attach a receiver for body-level write progress.
    pub fn set_attachment(&self, attachment: Option<Arc<dyn WriteFlushListener>>) {
        *self.attachment.lock().expect("stream lock") = attachment;
    }

    pub fn attachment(&self) -> Option<Arc<dyn WriteFlushListener>> {
        self.attachment.lock().expect("stream lock").clone()
    }

    // ── Idle tracking ──────────────────────────────────────────────────

    pub(crate) fn set_idle_timeout(&self, timeout: Duration) {
        *self.idle_timeout.lock().expect("stream lock") = timeout;
    }

    pub(crate) fn not_idle(&self) {
        *self.active_at.lock().expect("stream lock") = Instant::now();
    }

    fn is_idle_expired(&self) -> bool {
        let timeout = *self.idle_timeout.lock().expect("stream lock");
        !timeout.is_zero() && self.active_at.lock().expect("stream lock").elapsed() >= timeout
    }

    /// Invoked by the connection owner when the stream idle timer fires.
    /// Returns true when the stream was reset for idleness.
    pub fn on_idle_timeout(self: &Arc<Self>, session: &Arc<Session>) -> bool {
        if self.is_closed() || !self.is_idle_expired() {
            return false;
        }
        debug!(stream = self.id, "stream idle timeout");
        session.reset(ResetFrame::new(self.id, ErrorCode::Cancel), Callback::noop());
        true
    }

    // ── Close sub-machine ──────────────────────────────────────────────

    /// Advance the close state. `update` is the end-stream significance of
    /// the triggering frame; without it the state is untouched. Returns
    /// true when the stream reached `Closed` and the caller must remove it
    /// from the session.
    pub(crate) fn update_close(&self, session: &Session, update: bool, event: CloseEvent) -> bool {
        if !update {
            return false;
        }
        trace!(stream = self.id, ?event, state = ?self.close_state(), "close update");
        match event {
            CloseEvent::Received => self.update_close_after_received(session),
            CloseEvent::BeforeSend => self.update_close_before_send(session),
            CloseEvent::AfterSend => self.update_close_after_send(session),
        }
    }

    fn update_close_after_received(&self, session: &Session) -> bool {
        loop {
            let current = self.close_state();
            match current {
                CloseState::NotClosed => {
                    if self.cas(current, CloseState::RemotelyClosed) {
                        return false;
                    }
                }
                CloseState::LocallyClosing => {
                    if self.cas(current, CloseState::Closing) {
                        session.update_stream_count(self.local, 0, 1);
                        return false;
                    }
                }
                CloseState::LocallyClosed => {
                    self.close(session);
                    return true;
                }
                _ => return false,
            }
        }
    }

    fn update_close_before_send(&self, session: &Session) -> bool {
        loop {
            let current = self.close_state();
            match current {
                CloseState::NotClosed => {
                    if self.cas(current, CloseState::LocallyClosing) {
                        return false;
                    }
                }
                CloseState::RemotelyClosed => {
                    if self.cas(current, CloseState::Closing) {
                        session.update_stream_count(self.local, 0, 1);
                        return false;
                    }
                }
                _ => return false,
            }
        }
    }

    fn update_close_after_send(&self, session: &Session) -> bool {
        loop {
            let current = self.close_state();
            match current {
                CloseState::NotClosed | CloseState::LocallyClosing => {
                    if self.cas(current, CloseState::LocallyClosed) {
                        return false;
                    }
                }
                CloseState::RemotelyClosed | CloseState::Closing => {
                    self.close(session);
                    return true;
                }
                _ => return false,
            }
        }
    }

    fn cas(&self, current: CloseState, next: CloseState) -> bool {
        self.close_state
            .compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Force the stream closed, settling the session's stream counters.
    /// Idempotent.
    pub(crate) fn close(&self, session: &Session) {
        let old = CloseState::from_u8(
            self.close_state
                .swap(CloseState::Closed as u8, Ordering::AcqRel),
        );
        if old != CloseState::Closed {
            let delta_closing = if old == CloseState::Closing { -1 } else { 0 };
            session.update_stream_count(self.local, -1, delta_closing);
            debug!(stream = self.id, ?old, "stream closed");
        }
    }

    // ── Frame delivery ─────────────────────────────────────────────────

    /// Deliver a frame to this stream. The callback completes when the
    /// application has observed the frame; for DATA that completion returns
    /// the flow control credit.
    pub(crate) fn process(
        self: &Arc<Self>,
        session: &Arc<Session>,
        frame: &Frame,
        callback: Callback,
    ) {
        self.not_idle();
        match frame {
            Frame::Data(data) => {
                // Data on a stream the peer already finished is answered
                // with STREAM_CLOSED (RFC 7540 Section 5.1).
                if self.is_remotely_closed() || self.is_reset() {
                    session.reset(
                        ResetFrame::new(self.id, ErrorCode::StreamClosed),
                        Callback::noop(),
                    );
                    callback.failed(SessionError::Stream {
                        id: self.id,
                        code: ErrorCode::StreamClosed,
                    });
                    return;
                }
                // A stream window driven negative is a stream error; the
                // session window is checked by the session itself.
                if self.recv_window() < 0 {
                    session.reset(
                        ResetFrame::new(self.id, ErrorCode::FlowControlError),
                        Callback::noop(),
                    );
                    callback.failed(SessionError::Stream {
                        id: self.id,
                        code: ErrorCode::FlowControlError,
                    });
                    return;
                }
                if self.update_close(session, data.end_stream, CloseEvent::Received) {
                    session.remove_stream(self);
                }
                match self.listener() {
                    Some(listener) => listener.on_data(self, data, callback),
                    None => callback.succeeded(),
                }
            }
            Frame::Headers(headers) => {
                if self.update_close(session, headers.end_stream, CloseEvent::Received) {
                    session.remove_stream(self);
                }
                if let Some(listener) = self.listener() {
                    listener.on_headers(self, headers);
                }
                callback.succeeded();
            }
            Frame::Reset(reset) => {
                self.mark_reset();
                self.close(session);
                session.remove_stream(self);
                if let Some(listener) = self.listener() {
                    listener.on_reset(self, reset);
                }
                callback.succeeded();
            }
            Frame::PushPromise(_) => {
                // Pushed streams are implicitly locally closed; the peer's
                // end-stream closes them fully.
                self.update_close(session, true, CloseEvent::AfterSend);
                callback.succeeded();
            }
            Frame::WindowUpdate(_) => {
                // The adjustment itself is owned by the flusher.
                callback.succeeded();
            }
            Frame::Failure(failure) => {
                *self.failure.lock().expect("stream lock") = Some(failure.cause.clone());
                self.close(session);
                session.remove_stream(self);
                match self.listener() {
                    Some(listener) => listener.on_failure(self, &failure.cause, callback),
                    None => callback.succeeded(),
                }
            }
            _ => callback.succeeded(),
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stream#{}{{{},send={},recv={},{:?}}}",
            self.id,
            if self.local { "local" } else { "remote" },
            self.send_window(),
            self.recv_window(),
            self.close_state(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_updates_return_previous_value() {
        let stream = Stream::new(1, true);
        assert_eq!(stream.update_send_window(65_535), 0);
        assert_eq!(stream.update_send_window(-100), 65_535);
        assert_eq!(stream.send_window(), 65_435);
    }

    #[test]
    fn idle_expiry_requires_configured_timeout() {
        let stream = Stream::new(1, true);
        assert!(!stream.is_idle_expired());
        stream.set_idle_timeout(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(stream.is_idle_expired());
        stream.not_idle();
        assert!(!stream.is_idle_expired());
    }

    #[test]
    fn close_state_starts_not_closed() {
        let stream = Stream::new(2, false);
        assert_eq!(stream.close_state(), CloseState::NotClosed);
        assert!(!stream.is_remotely_closed());
        assert!(!stream.is_locally_closed());
    }
}
