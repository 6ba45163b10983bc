//! Application-facing listener traits.
//!
//! All methods have no-op defaults. The engine invokes listeners from its
//! dispatch paths and never lets listener behavior feed back into frame
//! processing.

use std::sync::Arc;

use crate::callback::Callback;
use crate::error::SessionError;
use crate::frame::{
    DataFrame, GoAwayFrame, HeadersFrame, PingFrame, PushPromiseFrame, ResetFrame, SettingsFrame,
};
use crate::session::Session;
use crate::stream::Stream;

/// Observer of session-level events.
pub trait SessionListener: Send + Sync {
    /// A remote peer opened a stream. Return the listener for that stream's
    /// subsequent frames, or `None` to ignore them.
    fn on_new_stream(
        &self,
        _stream: &Arc<Stream>,
        _frame: &HeadersFrame,
    ) -> Option<Arc<dyn StreamListener>> {
        None
    }

    fn on_settings(&self, _session: &Session, _frame: &SettingsFrame) {}

    /// A PING reply arrived.
    fn on_ping(&self, _session: &Session, _frame: &PingFrame) {}

    /// A RST_STREAM arrived for a stream already closed and removed.
    fn on_reset(&self, _session: &Session, _frame: &ResetFrame) {}

    /// The peer sent GO_AWAY. Complete `callback` when done observing; the
    /// drain-and-disconnect sequence runs after every open stream and this
    /// listener have reported.
    fn on_close(&self, _session: &Session, _frame: &GoAwayFrame, callback: Callback) {
        callback.succeeded();
    }

    /// The idle timeout expired with the session not closed. Return true to
    /// close the session.
    fn on_idle_timeout(&self, _session: &Session) -> bool {
        true
    }

    /// The session failed. Complete `callback` when done observing.
    fn on_failure(&self, _session: &Session, _failure: &SessionError, callback: Callback) {
        callback.succeeded();
    }
}

/// Observer of stream-level events.
pub trait StreamListener: Send + Sync {
    /// Trailers (or, on a client, response headers) arrived.
    fn on_headers(&self, _stream: &Arc<Stream>, _frame: &HeadersFrame) {}

    /// Body data arrived. Complete `callback` once consumed; completion
    /// returns the flow control credit to the peer.
    fn on_data(&self, _stream: &Arc<Stream>, _frame: &DataFrame, callback: Callback) {
        callback.succeeded();
    }

    /// The peer pushed a stream whose parent is this stream. Return the
    /// listener for the pushed stream.
    fn on_push(
        &self,
        _stream: &Arc<Stream>,
        _frame: &PushPromiseFrame,
    ) -> Option<Arc<dyn StreamListener>> {
        None
    }

    /// The peer reset this stream.
    fn on_reset(&self, _stream: &Arc<Stream>, _frame: &ResetFrame) {}

    /// The stream failed along with the session.
    fn on_failure(&self, _stream: &Arc<Stream>, _failure: &SessionError, callback: Callback) {
        callback.succeeded();
    }
}

/// Listener that ignores everything; useful as a default.
pub struct NoopListener;

impl SessionListener for NoopListener {}
impl StreamListener for NoopListener {}

/// Receiver of body-level write progress, attachable to a stream.
pub trait WriteFlushListener: Send + Sync {
    /// `bytes` of a DATA frame for this stream reached the transport.
    fn on_flushed(&self, bytes: u64);
}
