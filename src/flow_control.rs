//! Flow control strategy (RFC 7540 Section 6.9).
//!
//! The session debits windows on frame receipt and generation; the strategy
//! decides when credit is returned to the peer. [`SimpleFlowControl`]
//! returns credit as soon as the application consumes data, emitting one
//! WINDOW_UPDATE per consumed frame for the session and one for the stream.
//!
//! Inbound WINDOW_UPDATE frames are *not* applied here: the flusher owns
//! send-window adjustments so its write decisions see consistent windows.
//! The [`FlowControlStrategy::window_update`] hook fires when a
//! WINDOW_UPDATE we queued has been sent, which is where buffering
//! strategies reset their accounting.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::{debug, trace};

use crate::callback::Callback;
use crate::frame::{Frame, WindowUpdateFrame};
use crate::session::Session;
use crate::stream::Stream;

/// Default initial window size (RFC 7540 Section 6.9.2).
pub const DEFAULT_WINDOW_SIZE: i32 = 65_535;

pub trait FlowControlStrategy: Send + Sync {
    /// A stream entered the table; seed its windows.
    fn on_stream_created(&self, stream: &Arc<Stream>);

    /// A stream left the table.
    fn on_stream_destroyed(&self, stream: &Arc<Stream>);

    /// Flow-controlled bytes arrived. `stream` is absent when the frame
    /// targeted a stream not in the table; the session window is debited
    /// regardless so a flood on dead streams cannot starve live ones.
    fn on_data_received(&self, session: &Session, stream: Option<&Arc<Stream>>, length: i32);

    /// The application consumed received bytes; return the credit.
    fn on_data_consumed(&self, session: &Arc<Session>, stream: Option<&Arc<Stream>>, length: i32);

    /// DATA bytes are about to be written; debit the send windows.
    fn on_data_sending(&self, session: &Session, stream: &Arc<Stream>, length: i32);

    /// DATA bytes reached the transport.
    fn on_data_sent(&self, session: &Session, stream: &Arc<Stream>, length: i32);

    /// SETTINGS_INITIAL_WINDOW_SIZE changed. `local` is true when the change
    /// is ours (we sent the SETTINGS), false when it is the peer's.
    fn update_initial_stream_window(&self, session: &Arc<Session>, size: u32, local: bool);

    /// A WINDOW_UPDATE queued by this strategy has been sent to the peer.
    fn window_update(
        &self,
        session: &Session,
        stream: Option<&Arc<Stream>>,
        frame: &WindowUpdateFrame,
    );
}

/// Per-frame WINDOW_UPDATE strategy: every consumed frame immediately
/// restores its credit, however small.
pub struct SimpleFlowControl {
    initial_stream_send_window: AtomicI32,
    initial_stream_recv_window: AtomicI32,
}

impl SimpleFlowControl {
    pub fn new(initial_stream_recv_window: i32) -> Self {
        Self {
            initial_stream_send_window: AtomicI32::new(DEFAULT_WINDOW_SIZE),
            initial_stream_recv_window: AtomicI32::new(initial_stream_recv_window),
        }
    }
}

impl Default for SimpleFlowControl {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

impl FlowControlStrategy for SimpleFlowControl {
    fn on_stream_created(&self, stream: &Arc<Stream>) {
        stream.update_send_window(self.initial_stream_send_window.load(Ordering::Acquire));
        stream.update_recv_window(self.initial_stream_recv_window.load(Ordering::Acquire));
    }

    fn on_stream_destroyed(&self, stream: &Arc<Stream>) {
        trace!(stream = stream.id(), "stream destroyed");
    }

    fn on_data_received(&self, session: &Session, stream: Option<&Arc<Stream>>, length: i32) {
        let old_session = session.update_recv_window(-length);
        trace!(
            session_window = old_session - length,
            length, "session recv window debited"
        );
        if let Some(stream) = stream {
            let old_stream = stream.update_recv_window(-length);
            trace!(
                stream = stream.id(),
                stream_window = old_stream - length,
                "stream recv window debited"
            );
        }
    }

    fn on_data_consumed(&self, session: &Arc<Session>, stream: Option<&Arc<Stream>>, length: i32) {
        if length <= 0 {
            return;
        }
        // The session window is always restored; the stream window only
        // while the peer can still send on it.
        session.update_recv_window(length);
        let session_frame = Frame::WindowUpdate(WindowUpdateFrame::new(0, length));
        let mut more = Vec::new();
        if let Some(stream) = stream
            && !stream.is_remotely_closed()
            && !stream.is_reset()
        {
            stream.update_recv_window(length);
            more.push(Frame::WindowUpdate(WindowUpdateFrame::new(
                stream.id(),
                length,
            )));
        }
        debug!(length, stream = stream.map(|s| s.id()), "data consumed");
        session.frames(stream.cloned(), session_frame, more, Callback::noop());
    }

    fn on_data_sending(&self, session: &Session, stream: &Arc<Stream>, length: i32) {
        if length == 0 {
            return;
        }
        let old_session = session.update_send_window(-length);
        let old_stream = stream.update_send_window(-length);
        trace!(
            stream = stream.id(),
            session_window = old_session - length,
            stream_window = old_stream - length,
            length,
            "sending data"
        );
    }

    fn on_data_sent(&self, _session: &Session, stream: &Arc<Stream>, length: i32) {
        trace!(stream = stream.id(), length, "data sent");
    }

    fn update_initial_stream_window(&self, session: &Arc<Session>, size: u32, local: bool) {
        let size = size as i32;
        let previous = if local {
            self.initial_stream_recv_window.swap(size, Ordering::AcqRel)
        } else {
            self.initial_stream_send_window.swap(size, Ordering::AcqRel)
        };
        let delta = size - previous;
        if delta == 0 {
            return;
        }
        debug!(size, delta, local, "initial stream window updated");
        for stream in session.streams() {
            if local {
                stream.update_recv_window(delta);
            } else {
                // Send-window adjustments go through the flusher, the sole
                // owner of send-window effects during writes.
                session.route_window_update(
                    Some(stream.clone()),
                    WindowUpdateFrame::new(stream.id(), delta),
                );
            }
        }
    }

    fn window_update(
        &self,
        _session: &Session,
        stream: Option<&Arc<Stream>>,
        frame: &WindowUpdateFrame,
    ) {
        trace!(
            stream = stream.map(|s| s.id()),
            delta = frame.delta,
            "window update sent"
        );
    }
}
