//! Inbound frame parsing and the ingress listener interface.
//!
//! The transport's read loop feeds raw bytes to [`Parser::feed`]; complete
//! frames are dispatched to a [`FrameListener`], the interface the session
//! implements. Malformed input fails the connection through
//! `on_connection_failure` and poisons the parser.

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::error::{ErrorCode, SessionError};
use crate::frame::{
    self, DataFrame, Frame, GoAwayFrame, HeadersFrame, PingFrame, PriorityFrame, PushPromiseFrame,
    ResetFrame, SettingsFrame, WindowUpdateFrame,
};

/// Receiver of parsed frames; implemented by the session.
pub trait FrameListener: Send + Sync {
    fn on_data(&self, frame: DataFrame);
    fn on_headers(&self, frame: HeadersFrame);
    fn on_priority(&self, frame: PriorityFrame);
    fn on_reset(&self, frame: ResetFrame);
    fn on_settings(&self, frame: SettingsFrame);
    fn on_push_promise(&self, frame: PushPromiseFrame);
    fn on_ping(&self, frame: PingFrame);
    fn on_go_away(&self, frame: GoAwayFrame);
    fn on_window_update(&self, frame: WindowUpdateFrame);
    /// A stream-scoped fault detected below the session (e.g. by the header
    /// codec).
    fn on_stream_failure(&self, stream_id: u32, error: ErrorCode, reason: &str);
    /// A connection-scoped fault detected below the session.
    fn on_connection_failure(&self, error: ErrorCode, reason: &str);
    /// A frame from outside the HTTP/2 protocol (upgrade plumbing).
    fn on_frame(&self, frame: Frame);
}

/// Incremental frame parser for one connection.
pub struct Parser {
    buffer: BytesMut,
    max_frame_size: u32,
    failed: bool,
}

impl Parser {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
            failed: false,
        }
    }

    /// Raise the frame size limit when our SETTINGS advertise a larger one.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Feed transport bytes, dispatching every complete frame to
    /// `listener`. After a connection failure the parser discards input.
    pub fn feed(&mut self, data: &[u8], listener: &dyn FrameListener) {
        if self.failed {
            return;
        }
        self.buffer.extend_from_slice(data);
        loop {
            match frame::decode_frame(&self.buffer, self.max_frame_size) {
                Ok(Some((frame, consumed))) => {
                    let _ = self.buffer.split_to(consumed);
                    match frame {
                        Some(frame) => dispatch(frame, listener),
                        None => trace!("ignored unknown frame type"),
                    }
                }
                Ok(None) => return,
                Err(cause) => {
                    debug!(%cause, "parse failure");
                    self.failed = true;
                    match cause {
                        SessionError::Protocol { code, reason } => {
                            listener.on_connection_failure(code, &reason);
                        }
                        SessionError::Frame(reason) => {
                            listener.on_connection_failure(ErrorCode::FrameSizeError, &reason);
                        }
                        other => {
                            listener
                                .on_connection_failure(ErrorCode::ProtocolError, &other.to_string());
                        }
                    }
                    return;
                }
            }
        }
    }
}

fn dispatch(frame: Frame, listener: &dyn FrameListener) {
    match frame {
        Frame::Data(f) => listener.on_data(f),
        Frame::Headers(f) => listener.on_headers(f),
        Frame::Priority(f) => listener.on_priority(f),
        Frame::Reset(f) => listener.on_reset(f),
        Frame::Settings(f) => listener.on_settings(f),
        Frame::PushPromise(f) => listener.on_push_promise(f),
        Frame::Ping(f) => listener.on_ping(f),
        Frame::GoAway(f) => listener.on_go_away(f),
        Frame::WindowUpdate(f) => listener.on_window_update(f),
        // Synthetic frames never come off the wire.
        Frame::Disconnect | Frame::Failure(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        pings: Mutex<Vec<PingFrame>>,
        failures: Mutex<Vec<(ErrorCode, String)>>,
    }

    impl FrameListener for Recording {
        fn on_data(&self, _frame: DataFrame) {}
        fn on_headers(&self, _frame: HeadersFrame) {}
        fn on_priority(&self, _frame: PriorityFrame) {}
        fn on_reset(&self, _frame: ResetFrame) {}
        fn on_settings(&self, _frame: SettingsFrame) {}
        fn on_push_promise(&self, _frame: PushPromiseFrame) {}
        fn on_ping(&self, frame: PingFrame) {
            self.pings.lock().unwrap().push(frame);
        }
        fn on_go_away(&self, _frame: GoAwayFrame) {}
        fn on_window_update(&self, _frame: WindowUpdateFrame) {}
        fn on_stream_failure(&self, _stream_id: u32, _error: ErrorCode, _reason: &str) {}
        fn on_connection_failure(&self, error: ErrorCode, reason: &str) {
            self.failures
                .lock()
                .unwrap()
                .push((error, reason.to_string()));
        }
        fn on_frame(&self, _frame: Frame) {}
    }

    #[test]
    fn split_feed_reassembles_frames() {
        let mut buf = BytesMut::new();
        PingFrame::new([9; 8]).encode(&mut buf);
        let listener = Recording::default();
        let mut parser = Parser::new(16_384);
        parser.feed(&buf[..5], &listener);
        assert!(listener.pings.lock().unwrap().is_empty());
        parser.feed(&buf[5..], &listener);
        assert_eq!(listener.pings.lock().unwrap().len(), 1);
    }

    #[test]
    fn failure_poisons_parser() {
        let mut buf = BytesMut::new();
        // WINDOW_UPDATE with zero increment is a protocol error.
        frame::encode_frame_header(&mut buf, 4, 0x8, 0, 1);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        PingFrame::new([1; 8]).encode(&mut buf);
        let listener = Recording::default();
        let mut parser = Parser::new(16_384);
        parser.feed(&buf, &listener);
        assert_eq!(listener.failures.lock().unwrap().len(), 1);
        // The trailing PING is never delivered.
        assert!(listener.pings.lock().unwrap().is_empty());
    }
}
