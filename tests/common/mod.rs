//! Shared test fixtures: an in-memory endpoint capturing written frames,
//! and recording listeners.

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use weftline::api::{SessionListener, StreamListener};
use weftline::callback::Callback;
use weftline::config::SessionConfig;
use weftline::endpoint::Endpoint;
use weftline::error::SessionError;
use weftline::frame::{
    self, DataFrame, Frame, GoAwayFrame, HeadersFrame, PingFrame, ResetFrame, SettingsFrame,
};
use weftline::session::Session;
use weftline::role::SessionRole;
use weftline::stream::Stream;

/// Endpoint that records everything the session writes.
pub struct TestEndpoint {
    written: Mutex<Vec<u8>>,
    open: AtomicBool,
    output_shutdown: AtomicBool,
    fail_writes: AtomicBool,
    idle_timeout: Duration,
}

impl TestEndpoint {
    pub fn new() -> Arc<Self> {
        Self::with_idle_timeout(Duration::from_secs(30))
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            written: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            output_shutdown: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            idle_timeout,
        })
    }

    /// Decode and drain every complete frame written so far.
    pub fn take_frames(&self) -> Vec<Frame> {
        let mut written = self.written.lock().unwrap();
        let mut frames = Vec::new();
        let mut offset = 0;
        while let Ok(Some((frame, consumed))) =
            frame::decode_frame(&written[offset..], 16_777_215)
        {
            offset += consumed;
            if let Some(frame) = frame {
                frames.push(frame);
            }
            if offset >= written.len() {
                break;
            }
        }
        written.drain(..offset);
        frames
    }

    pub fn written_bytes(&self) -> usize {
        self.written.lock().unwrap().len()
    }

    pub fn is_output_shutdown(&self) -> bool {
        self.output_shutdown.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }
}

impl Endpoint for TestEndpoint {
    fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "test write failure"));
        }
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    fn shutdown_output(&self) {
        self.output_shutdown.store(true, Ordering::SeqCst);
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

/// Session listener recording every notification.
#[derive(Default)]
pub struct RecordingListener {
    pub new_streams: Mutex<Vec<u32>>,
    pub settings: Mutex<Vec<SettingsFrame>>,
    pub pings: Mutex<Vec<PingFrame>>,
    pub resets: Mutex<Vec<ResetFrame>>,
    pub closes: Mutex<Vec<GoAwayFrame>>,
    pub failures: Mutex<Vec<SessionError>>,
    pub idle_verdict: AtomicBool,
    pub idle_timeouts: AtomicUsize,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        let listener = Self::default();
        listener.idle_verdict.store(true, Ordering::SeqCst);
        Arc::new(listener)
    }
}

impl SessionListener for RecordingListener {
    fn on_new_stream(
        &self,
        stream: &Arc<Stream>,
        _frame: &HeadersFrame,
    ) -> Option<Arc<dyn StreamListener>> {
        self.new_streams.lock().unwrap().push(stream.id());
        None
    }

    fn on_settings(&self, _session: &Session, frame: &SettingsFrame) {
        self.settings.lock().unwrap().push(frame.clone());
    }

    fn on_ping(&self, _session: &Session, frame: &PingFrame) {
        self.pings.lock().unwrap().push(*frame);
    }

    fn on_reset(&self, _session: &Session, frame: &ResetFrame) {
        self.resets.lock().unwrap().push(*frame);
    }

    fn on_close(&self, _session: &Session, frame: &GoAwayFrame, callback: Callback) {
        self.closes.lock().unwrap().push(frame.clone());
        callback.succeeded();
    }

    fn on_idle_timeout(&self, _session: &Session) -> bool {
        self.idle_timeouts.fetch_add(1, Ordering::SeqCst);
        self.idle_verdict.load(Ordering::SeqCst)
    }

    fn on_failure(&self, _session: &Session, failure: &SessionError, callback: Callback) {
        self.failures.lock().unwrap().push(failure.clone());
        callback.succeeded();
    }
}

/// Stream listener recording data and failures.
#[derive(Default)]
pub struct RecordingStreamListener {
    pub data: Mutex<Vec<DataFrame>>,
    pub headers: Mutex<Vec<HeadersFrame>>,
    pub resets: Mutex<Vec<ResetFrame>>,
    pub failures: Mutex<Vec<SessionError>>,
}

impl RecordingStreamListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl StreamListener for RecordingStreamListener {
    fn on_headers(&self, _stream: &Arc<Stream>, frame: &HeadersFrame) {
        self.headers.lock().unwrap().push(frame.clone());
    }

    fn on_data(&self, _stream: &Arc<Stream>, frame: &DataFrame, callback: Callback) {
        self.data.lock().unwrap().push(frame.clone());
        callback.succeeded();
    }

    fn on_reset(&self, _stream: &Arc<Stream>, frame: &ResetFrame) {
        self.resets.lock().unwrap().push(*frame);
    }

    fn on_failure(&self, _stream: &Arc<Stream>, failure: &SessionError, callback: Callback) {
        self.failures.lock().unwrap().push(failure.clone());
        callback.succeeded();
    }
}

pub fn client(endpoint: Arc<TestEndpoint>) -> Arc<Session> {
    Session::builder(SessionRole::Client, endpoint)
        .build()
        .unwrap()
}

pub fn client_with(
    endpoint: Arc<TestEndpoint>,
    listener: Arc<RecordingListener>,
    config: SessionConfig,
) -> Arc<Session> {
    Session::builder(SessionRole::Client, endpoint)
        .listener(listener)
        .config(config)
        .build()
        .unwrap()
}

pub fn server_with(
    endpoint: Arc<TestEndpoint>,
    listener: Arc<RecordingListener>,
    config: SessionConfig,
) -> Arc<Session> {
    Session::builder(SessionRole::Server, endpoint)
        .listener(listener)
        .config(config)
        .build()
        .unwrap()
}

/// Stream ids of every HEADERS frame captured, in wire order.
pub fn headers_stream_ids(frames: &[Frame]) -> Vec<u32> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Headers(headers) => Some(headers.stream_id),
            _ => None,
        })
        .collect()
}

/// DATA payload lengths captured, in wire order.
pub fn data_lengths(frames: &[Frame]) -> Vec<usize> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Data(data) => Some(data.remaining()),
            _ => None,
        })
        .collect()
}
