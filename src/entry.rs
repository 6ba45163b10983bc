//! Egress queue entries.
//!
//! Frames are generated as late as possible, while the flusher drains its
//! queue, so generation sees current windows and settings. Control frames
//! generate whole; DATA entries fragment against the available flow control
//! window and re-enter the queue until drained, firing their user callback
//! only on the final emission.

use bytes::BytesMut;
use std::sync::Arc;
use tracing::trace;

use crate::callback::Callback;
use crate::error::SessionError;
use crate::frame::{DataFrame, Frame, FrameType};
use crate::metrics;
use crate::session::Session;
use crate::stream::{CloseEvent, Stream};

/// Outcome of one generation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Generated {
    /// A frame was appended to the write buffer.
    Written,
    /// The flow control window is exhausted; retry after a window update.
    Stalled,
}

/// Outcome of a successful flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    Done,
    /// DATA remains; the entry re-enters the queue.
    Pending,
}

pub(crate) enum Entry {
    Control(ControlEntry),
    Data(DataEntry),
}

impl Entry {
    pub fn control(frame: Frame, stream: Option<Arc<Stream>>, callback: Callback) -> Self {
        Entry::Control(ControlEntry {
            frame,
            stream,
            callback,
            frame_bytes: 0,
        })
    }

    pub fn data(frame: DataFrame, stream: Arc<Stream>, callback: Callback) -> Self {
        let data_remaining = frame.remaining();
        Entry::Data(DataEntry {
            frame,
            stream,
            callback,
            offset: 0,
            data_remaining,
            frame_bytes: 0,
            data_bytes: 0,
        })
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Entry::Control(entry) => entry.frame.frame_type(),
            Entry::Data(_) => FrameType::Data,
        }
    }

    pub fn stream(&self) -> Option<&Arc<Stream>> {
        match self {
            Entry::Control(entry) => entry.stream.as_ref(),
            Entry::Data(entry) => Some(&entry.stream),
        }
    }

    pub fn generate(
        &mut self,
        session: &Arc<Session>,
        buf: &mut BytesMut,
    ) -> Result<Generated, SessionError> {
        match self {
            Entry::Control(entry) => entry.generate(session, buf),
            Entry::Data(entry) => entry.generate(session, buf),
        }
    }

    /// The generated bytes reached the transport.
    pub fn on_success(&mut self, session: &Arc<Session>) -> Completion {
        match self {
            Entry::Control(entry) => entry.on_success(session),
            Entry::Data(entry) => entry.on_success(session),
        }
    }

    pub fn fail(self, session: &Arc<Session>, cause: SessionError) {
        match self {
            Entry::Control(entry) => entry.fail(session, cause),
            Entry::Data(entry) => entry.callback.failed(cause),
        }
    }
}

/// A non-DATA frame: generated whole, flushed once.
pub(crate) struct ControlEntry {
    frame: Frame,
    stream: Option<Arc<Stream>>,
    callback: Callback,
    frame_bytes: usize,
}

impl ControlEntry {
    fn generate(
        &mut self,
        session: &Arc<Session>,
        buf: &mut BytesMut,
    ) -> Result<Generated, SessionError> {
        self.frame_bytes += session.generator().control(buf, &self.frame)?;
        self.before_send(session);
        Ok(Generated::Written)
    }

    /// Actions performed right before the frame is handed to the socket.
    /// The peer may react to the frame before `on_success` runs, so state
    /// its reactions depend on must be updated here.
    fn before_send(&self, session: &Arc<Session>) {
        match &self.frame {
            Frame::Headers(headers) => {
                if let Some(stream) = &self.stream {
                    stream.update_close(session, headers.end_stream, CloseEvent::BeforeSend);
                }
            }
            Frame::Settings(settings) if !settings.reply => {
                // An INITIAL_WINDOW_SIZE we are sending is ours: the peer
                // may rely on it as soon as the frame arrives.
                if let Some(size) = settings.get(crate::settings::INITIAL_WINDOW_SIZE) {
                    session
                        .flow_control()
                        .update_initial_stream_window(session, size, true);
                }
            }
            _ => {}
        }
    }

    fn on_success(&mut self, session: &Arc<Session>) -> Completion {
        session.add_bytes_written(self.frame_bytes as u64);
        self.frame_bytes = 0;
        metrics::FRAMES_SENT.increment();

        match &self.frame {
            Frame::Headers(headers) => {
                if let Some(stream) = &self.stream {
                    session.on_stream_opened(stream);
                    if stream.update_close(session, headers.end_stream, CloseEvent::AfterSend) {
                        session.remove_stream(stream);
                    }
                }
            }
            Frame::Reset(_) => {
                if let Some(stream) = &self.stream {
                    stream.mark_reset();
                    stream.close(session);
                    session.remove_stream(stream);
                }
                metrics::RESETS_SENT.increment();
            }
            Frame::PushPromise(_) => {
                // Pushed streams are implicitly remotely closed; they close
                // fully when their end-stream DATA is sent.
                if let Some(stream) = &self.stream {
                    stream.update_close(session, true, CloseEvent::Received);
                }
            }
            Frame::GoAway(_) => {
                // Only shut down the output, without closing yet, so
                // straggler frames from the peer can still be read.
                metrics::GOAWAYS_SENT.increment();
                session.endpoint().shutdown_output();
            }
            Frame::WindowUpdate(window_update) => {
                session
                    .flow_control()
                    .window_update(session, self.stream.as_ref(), window_update);
            }
            Frame::Disconnect => {
                session.terminate(SessionError::ClosedChannel);
            }
            _ => {}
        }

        self.callback.succeeded();
        Completion::Done
    }

    fn fail(self, session: &Arc<Session>, cause: SessionError) {
        if self.frame.frame_type() == FrameType::Disconnect {
            session.terminate(SessionError::ClosedChannel);
        }
        self.callback.failed(cause);
    }
}

/// A DATA frame, fragmentable by flow control.
pub(crate) struct DataEntry {
    frame: DataFrame,
    stream: Arc<Stream>,
    callback: Callback,
    offset: usize,
    data_remaining: usize,
    /// Frame bytes generated since the last flush.
    frame_bytes: usize,
    /// Data bytes generated since the last flush.
    data_bytes: usize,
}

impl DataEntry {
    fn generate(
        &mut self,
        session: &Arc<Session>,
        buf: &mut BytesMut,
    ) -> Result<Generated, SessionError> {
        let session_window = session.send_window();
        let stream_window = self.stream.send_window();
        let window = stream_window.min(session_window);
        if window <= 0 && self.data_remaining > 0 {
            metrics::FLOW_STALLS.increment();
            trace!(
                stream = self.stream.id(),
                stream_window, session_window, "data stalled on window"
            );
            return Ok(Generated::Stalled);
        }

        // Only one DATA frame is generated per attempt.
        let length = self.data_remaining.min(window.max(0) as usize);
        let (frame_bytes, data_bytes) =
            session
                .generator()
                .data(buf, &self.frame, self.offset, length);
        self.frame_bytes += frame_bytes;
        self.offset += data_bytes;
        self.data_remaining -= data_bytes;
        self.data_bytes += data_bytes;
        trace!(
            stream = self.stream.id(),
            data_bytes,
            window,
            remaining = self.data_remaining,
            "generated data"
        );

        session
            .flow_control()
            .on_data_sending(session, &self.stream, data_bytes as i32);

        if self.data_remaining == 0 {
            self.stream
                .update_close(session, self.frame.end_stream, CloseEvent::BeforeSend);
        }

        Ok(Generated::Written)
    }

    fn on_success(&mut self, session: &Arc<Session>) -> Completion {
        session.add_bytes_written(self.frame_bytes as u64);
        metrics::FRAMES_SENT.increment();
        if let Some(attachment) = self.stream.attachment() {
            attachment.on_flushed(self.frame_bytes as u64);
        }
        self.frame_bytes = 0;

        session
            .flow_control()
            .on_data_sent(session, &self.stream, self.data_bytes as i32);
        self.data_bytes = 0;

        if self.data_remaining > 0 {
            return Completion::Pending;
        }
        // Only now can the close state advance and the stream be removed;
        // the user callback fires exactly once, on this final emission.
        if self
            .stream
            .update_close(session, self.frame.end_stream, CloseEvent::AfterSend)
        {
            session.remove_stream(&self.stream);
        }
        self.callback.succeeded();
        Completion::Done
    }
}
