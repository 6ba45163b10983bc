//! Close orchestration: GO_AWAY, transport FIN, idle timeout, failures.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;

use common::*;
use weftline::Endpoint;
use weftline::callback::{Callback, Promise};
use weftline::config::SessionConfig;
use weftline::error::ErrorCode;
use weftline::frame::{Frame, GoAwayFrame, HeadersFrame, PingFrame};
use weftline::parser::FrameListener;
use weftline::session::SessionState;
use weftline::stream::Stream;

fn open_stream_with(
    session: &Arc<weftline::Session>,
    listener: Arc<RecordingStreamListener>,
) -> Arc<Stream> {
    let (tx, rx) = mpsc::channel();
    session.new_stream(
        HeadersFrame::new(0, Bytes::new(), false),
        Promise::new(move |result| tx.send(result).unwrap()),
        Some(listener),
    );
    rx.recv().unwrap().unwrap()
}

fn go_aways(frames: Vec<Frame>) -> Vec<GoAwayFrame> {
    frames
        .into_iter()
        .filter_map(|frame| match frame {
            Frame::GoAway(go_away) => Some(go_away),
            _ => None,
        })
        .collect()
}

#[test]
fn close_emits_goaway_and_shuts_down_output() {
    let endpoint = TestEndpoint::new();
    let session = client(endpoint.clone());

    let (tx, rx) = mpsc::channel();
    let initiated = session.close(
        ErrorCode::NoError,
        Some("done"),
        Callback::new(move |result| tx.send(result).unwrap()),
    );
    assert!(initiated);
    assert!(rx.recv().unwrap().is_ok());

    assert_eq!(session.state(), SessionState::LocallyClosed);
    let frames = go_aways(endpoint.take_frames());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].error, ErrorCode::NoError);
    assert_eq!(frames[0].reason().as_deref(), Some("done"));
    // GO_AWAY only shuts the write half; reads may still drain.
    assert!(endpoint.is_output_shutdown());
    assert!(endpoint.is_open());
}

#[test]
fn second_close_is_a_noop_that_succeeds_immediately() {
    let endpoint = TestEndpoint::new();
    let session = client(endpoint.clone());

    assert!(session.close(ErrorCode::NoError, None, Callback::noop()));
    endpoint.take_frames();

    let (tx, rx) = mpsc::channel();
    let initiated = session.close(
        ErrorCode::Cancel,
        Some("again"),
        Callback::new(move |result| tx.send(result).unwrap()),
    );
    assert!(!initiated);
    assert!(rx.recv().unwrap().is_ok());
    assert!(go_aways(endpoint.take_frames()).is_empty());
}

#[test]
fn goaway_reason_is_truncated_to_32_bytes() {
    let endpoint = TestEndpoint::new();
    let session = client(endpoint.clone());

    let reason = "r".repeat(100);
    session.close(ErrorCode::NoError, Some(&reason), Callback::noop());

    let frames = go_aways(endpoint.take_frames());
    assert_eq!(frames[0].payload.as_ref().unwrap().len(), 32);
}

#[test]
fn peer_goaway_drains_then_disconnects() {
    let endpoint = TestEndpoint::new();
    let listener = RecordingListener::new();
    let session = client_with(endpoint.clone(), listener.clone(), SessionConfig::default());

    let stream_listener = RecordingStreamListener::new();
    let stream = open_stream_with(&session, stream_listener.clone());
    endpoint.take_frames();

    session.on_go_away(GoAwayFrame {
        last_stream_id: 7,
        error: ErrorCode::NoError,
        payload: None,
    });

    // The application observed the close; once its callback completed the
    // queue drained, the session terminated and the endpoint closed. No
    // GO_AWAY goes out in response to a GO_AWAY.
    assert_eq!(listener.closes.lock().unwrap().len(), 1);
    assert_eq!(listener.closes.lock().unwrap()[0].last_stream_id, 7);
    assert!(session.stream(stream.id()).is_none());
    assert!(stream.is_closed());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!endpoint.is_open());
    assert!(go_aways(endpoint.take_frames()).is_empty());

    // Close during/after remote close: not initiated, succeeds right away.
    let (tx, rx) = mpsc::channel();
    let initiated = session.close(
        ErrorCode::NoError,
        None,
        Callback::new(move |result| tx.send(result).unwrap()),
    );
    assert!(!initiated);
    assert!(rx.recv().unwrap().is_ok());
}

#[test]
fn second_goaway_is_ignored() {
    let endpoint = TestEndpoint::new();
    let listener = RecordingListener::new();
    let session = client_with(endpoint.clone(), listener.clone(), SessionConfig::default());

    let frame = GoAwayFrame {
        last_stream_id: 0,
        error: ErrorCode::NoError,
        payload: None,
    };
    session.on_go_away(frame.clone());
    session.on_go_away(frame);

    assert_eq!(listener.closes.lock().unwrap().len(), 1);
}

#[test]
fn abrupt_fin_aborts_without_goaway() {
    let endpoint = TestEndpoint::new();
    let session = client(endpoint.clone());

    let stream_listener = RecordingStreamListener::new();
    open_stream_with(&session, stream_listener.clone());
    endpoint.take_frames();

    session.on_shutdown();

    assert_eq!(session.state(), SessionState::Closed);
    assert!(!endpoint.is_open());
    assert!(go_aways(endpoint.take_frames()).is_empty());
    assert_eq!(stream_listener.failures.lock().unwrap().len(), 1);
    assert_eq!(session.stream_count(), 0);
}

#[test]
fn fin_after_local_close_completes_the_disconnect() {
    let endpoint = TestEndpoint::new();
    let session = client(endpoint.clone());

    session.close(ErrorCode::NoError, None, Callback::noop());
    assert!(endpoint.is_open());

    session.on_shutdown();

    assert_eq!(session.state(), SessionState::Closed);
    assert!(!endpoint.is_open());
}

#[test]
fn idle_timeout_before_expiry_does_nothing() {
    let endpoint = TestEndpoint::with_idle_timeout(Duration::from_secs(60));
    let listener = RecordingListener::new();
    let session = client_with(endpoint.clone(), listener.clone(), SessionConfig::default());

    assert!(!session.on_idle_timeout());
    assert_eq!(listener.idle_timeouts.load(Ordering::SeqCst), 0);
    assert!(!session.is_closed());
}

#[test]
fn idle_timeout_defers_to_the_listener_when_not_closed() {
    let endpoint = TestEndpoint::with_idle_timeout(Duration::from_millis(5));
    let listener = RecordingListener::new();
    let session = client_with(endpoint.clone(), listener.clone(), SessionConfig::default());

    std::thread::sleep(Duration::from_millis(10));

    listener.idle_verdict.store(false, Ordering::SeqCst);
    assert!(!session.on_idle_timeout());
    assert_eq!(listener.idle_timeouts.load(Ordering::SeqCst), 1);
    assert!(!session.is_closed());

    listener.idle_verdict.store(true, Ordering::SeqCst);
    assert!(session.on_idle_timeout());
    // The verdict tells the caller to close; the engine took no action yet.
    assert!(!session.is_closed());
}

#[test]
fn idle_timeout_during_close_in_flight_aborts() {
    let endpoint = TestEndpoint::with_idle_timeout(Duration::from_millis(5));
    let listener = RecordingListener::new();
    let session = client_with(endpoint.clone(), listener.clone(), SessionConfig::default());

    session.close(ErrorCode::NoError, None, Callback::noop());
    assert_eq!(session.state(), SessionState::LocallyClosed);

    assert!(!session.on_idle_timeout());

    // No listener consultation on this branch.
    assert_eq!(listener.idle_timeouts.load(Ordering::SeqCst), 0);
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!endpoint.is_open());
}

#[test]
fn connection_failure_fails_streams_then_closes() {
    let endpoint = TestEndpoint::new();
    let listener = RecordingListener::new();
    let session = client_with(endpoint.clone(), listener.clone(), SessionConfig::default());

    let first = RecordingStreamListener::new();
    let second = RecordingStreamListener::new();
    open_stream_with(&session, first.clone());
    open_stream_with(&session, second.clone());
    endpoint.take_frames();

    session.on_connection_failure(ErrorCode::ProtocolError, "bad_frame");

    assert_eq!(first.failures.lock().unwrap().len(), 1);
    assert_eq!(second.failures.lock().unwrap().len(), 1);
    assert_eq!(listener.failures.lock().unwrap().len(), 1);
    assert_eq!(session.state(), SessionState::LocallyClosed);

    let frames = go_aways(endpoint.take_frames());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].error, ErrorCode::ProtocolError);
    assert_eq!(frames[0].reason().as_deref(), Some("bad_frame"));
    assert!(endpoint.is_output_shutdown());
}

#[test]
fn write_failure_terminates_the_session() {
    let endpoint = TestEndpoint::new();
    let session = client(endpoint.clone());

    endpoint.fail_writes();
    let (tx, rx) = mpsc::channel();
    session.ping(
        PingFrame::new([0; 8]),
        Callback::new(move |result| tx.send(result).unwrap()),
    );

    assert!(rx.recv().unwrap().is_err());
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!endpoint.is_open());
}

#[test]
fn stop_closes_then_disconnects() {
    let endpoint = TestEndpoint::new();
    let session = client(endpoint.clone());

    session.stop();

    let frames = go_aways(endpoint.take_frames());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].reason().as_deref(), Some("stop"));
    assert!(!endpoint.is_open());
}

#[test]
fn terminate_fails_queued_writes() {
    let endpoint = TestEndpoint::new();
    let session = client(endpoint.clone());

    // An abrupt shutdown with a write already queued behind a stalled
    // window: the queued callback must fail, not hang.
    let stream_listener = RecordingStreamListener::new();
    let stream = open_stream_with(&session, stream_listener);
    // Exhaust the send window so the next DATA parks.
    session.data(
        stream.clone(),
        weftline::frame::DataFrame::new(stream.id(), Bytes::from(vec![0u8; 65_535]), false),
        Callback::noop(),
    );
    let (tx, rx) = mpsc::channel();
    session.data(
        stream.clone(),
        weftline::frame::DataFrame::new(stream.id(), Bytes::from_static(b"tail"), true),
        Callback::new(move |result| tx.send(result).unwrap()),
    );

    session.on_shutdown();

    assert!(rx.recv().unwrap().is_err());
    assert_eq!(session.state(), SessionState::Closed);
}
