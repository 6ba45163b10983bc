//! Client/server HEADERS handling.
//!
//! The two endpoint roles differ almost entirely in how they treat inbound
//! HEADERS and PUSH_PROMISE: a server opens remote streams for new
//! requests, a client delivers responses and completes pushes. Everything
//! else in the session is role-agnostic.

use std::sync::Arc;

use tracing::debug;

use crate::callback::Callback;
use crate::error::ErrorCode;
use crate::frame::{Frame, HeadersFrame, PushPromiseFrame};
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

impl SessionRole {
    /// Seed for the local stream-id allocator: clients use odd ids from 1,
    /// servers even ids from 2.
    pub fn initial_stream_id(self) -> u32 {
        match self {
            SessionRole::Client => 1,
            SessionRole::Server => 2,
        }
    }

    pub(crate) fn on_headers(self, session: &Arc<Session>, frame: HeadersFrame) {
        match self {
            SessionRole::Client => client_headers(session, frame),
            SessionRole::Server => server_headers(session, frame),
        }
    }

    pub(crate) fn on_push_promise(self, session: &Arc<Session>, frame: PushPromiseFrame) {
        match self {
            SessionRole::Client => client_push_promise(session, frame),
            SessionRole::Server => {
                // Clients cannot push.
                session.on_connection_failure_with(
                    ErrorCode::ProtocolError,
                    "unexpected_push_promise_frame",
                    Callback::noop(),
                );
            }
        }
    }
}

/// Server side: a HEADERS on an open stream carries trailers; on a fresh
/// remote id it opens the stream and hands it to the application.
fn server_headers(session: &Arc<Session>, frame: HeadersFrame) {
    let stream_id = frame.stream_id;

    if let Some(stream) = session.stream(stream_id) {
        stream.process(session, &Frame::Headers(frame), Callback::noop());
        return;
    }

    if stream_id % 2 == 0 {
        // Clients may only open odd ids.
        session.on_connection_failure_with(
            ErrorCode::ProtocolError,
            "invalid_stream_id",
            Callback::noop(),
        );
        return;
    }

    if session.is_stream_closed(stream_id) {
        debug!(stream = stream_id, "ignoring headers for closed stream");
        return;
    }

    // Duplicate ids fail the connection inside create_remote_stream; an id
    // over the concurrency limit was refused there with a reset.
    if let Some(stream) = session.create_remote_stream(stream_id) {
        session.on_stream_opened(&stream);
        stream.process(session, &Frame::Headers(frame.clone()), Callback::noop());
        let listener = session.notify_new_stream(&stream, &frame);
        stream.set_listener(listener);
    }
}

/// Client side: HEADERS deliver a response or trailers to a stream we
/// opened.
fn client_headers(session: &Arc<Session>, frame: HeadersFrame) {
    let stream_id = frame.stream_id;
    match session.stream(stream_id) {
        Some(stream) => {
            stream.process(session, &Frame::Headers(frame), Callback::noop());
        }
        None => {
            if session.is_stream_closed(stream_id) {
                debug!(stream = stream_id, "ignoring headers for closed stream");
            } else {
                session.on_connection_failure_with(
                    ErrorCode::ProtocolError,
                    "unexpected_headers_frame",
                    Callback::noop(),
                );
            }
        }
    }
}

/// Client side: the peer reserves a pushed stream under one of our open
/// requests.
fn client_push_promise(session: &Arc<Session>, frame: PushPromiseFrame) {
    let Some(parent) = session.stream(frame.stream_id) else {
        debug!(stream = frame.stream_id, "ignoring push promise for unknown stream");
        return;
    };
    if let Some(pushed) = session.create_remote_stream(frame.promised_stream_id) {
        pushed.process(session, &Frame::PushPromise(frame.clone()), Callback::noop());
        let listener = parent.listener().and_then(|l| l.on_push(&parent, &frame));
        pushed.set_listener(listener);
    }
}
