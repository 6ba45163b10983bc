//! The HTTP/2 session: one per connection.
//!
//! The session owns the stream table, the close-state register, the session
//! flow control windows, and the egress machinery (stream creator +
//! flusher). Ingress arrives through the [`FrameListener`] implementation;
//! egress is submitted concurrently by application threads and drained by
//! the flusher's single write loop.
//!
//! There is no session-wide lock. Counters, windows, and the close state
//! are atomics; the stream table is a guarded map; the stream creator's
//! slot reservation is the only synchronized region and holds its lock for
//! O(1) work.

use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::api::{SessionListener, StreamListener};
use crate::callback::{Callback, CountingCallback, Promise};
use crate::config::SessionConfig;
use crate::creator::StreamCreator;
use crate::endpoint::Endpoint;
use crate::entry::Entry;
use crate::error::{ErrorCode, SessionError};
use crate::flow_control::{DEFAULT_WINDOW_SIZE, FlowControlStrategy, SimpleFlowControl};
use crate::flusher::Flusher;
use crate::frame::{
    DataFrame, FailureFrame, Frame, FrameType, GoAwayFrame, HeadersFrame, PingFrame, PriorityFrame,
    PushPromiseFrame, ResetFrame, SettingsFrame, WindowUpdateFrame,
};
use crate::generator::Generator;
use crate::metrics;
use crate::parser::FrameListener;
use crate::role::SessionRole;
use crate::settings;
use crate::stream::Stream;

/// Session close states. `Closed` is absorbing; transitions are
/// single-writer via compare-and-set on one atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    NotClosed = 0,
    LocallyClosed = 1,
    RemotelyClosed = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotClosed,
            1 => Self::LocallyClosed,
            2 => Self::RemotelyClosed,
            _ => Self::Closed,
        }
    }
}

/// Builder for a [`Session`].
pub struct SessionBuilder {
    role: SessionRole,
    endpoint: Arc<dyn Endpoint>,
    listener: Arc<dyn SessionListener>,
    flow_control: Option<Arc<dyn FlowControlStrategy>>,
    config: SessionConfig,
}

impl SessionBuilder {
    pub fn new(role: SessionRole, endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            role,
            endpoint,
            listener: Arc::new(crate::api::NoopListener),
            flow_control: None,
            config: SessionConfig::default(),
        }
    }

    pub fn listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn flow_control(mut self, flow_control: Arc<dyn FlowControlStrategy>) -> Self {
        self.flow_control = Some(flow_control);
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Arc<Session>, SessionError> {
        self.config.validate()?;
        let initial_stream_id = match self.config.initial_stream_id {
            Some(id) => {
                if id == 0 || (id & 1) != (self.role.initial_stream_id() & 1) {
                    return Err(SessionError::InvalidArgument(
                        "initial_stream_id must be non-zero and match the role parity",
                    ));
                }
                id
            }
            None => self.role.initial_stream_id(),
        };
        let flow_control = self
            .flow_control
            .unwrap_or_else(|| Arc::new(SimpleFlowControl::default()));
        Ok(Arc::new(Session {
            role: self.role,
            endpoint: self.endpoint,
            generator: Generator::new(),
            listener: self.listener,
            flow_control,
            flusher: Flusher::new(),
            creator: StreamCreator::new(),
            streams: Mutex::new(HashMap::new()),
            local_stream_ids: AtomicU32::new(initial_stream_id),
            last_remote_stream_id: AtomicI32::new(if initial_stream_id & 1 == 1 {
                0
            } else {
                -1
            }),
            local_stream_count: AtomicI32::new(0),
            remote_stream_count: AtomicU64::new(0),
            send_window: AtomicI32::new(DEFAULT_WINDOW_SIZE),
            recv_window: AtomicI32::new(DEFAULT_WINDOW_SIZE),
            closed: AtomicU8::new(SessionState::NotClosed as u8),
            bytes_written: AtomicU64::new(0),
            max_local_streams: AtomicI32::new(self.config.max_local_streams),
            max_remote_streams: AtomicI32::new(self.config.max_remote_streams),
            push_enabled: AtomicBool::new(true),
            idle_time: Mutex::new(Instant::now()),
            close_frame: Mutex::new(None),
            config: self.config,
        }))
    }
}

/// HTTP/2 session state for one bidirectional transport connection.
pub struct Session {
    role: SessionRole,
    endpoint: Arc<dyn Endpoint>,
    generator: Generator,
    listener: Arc<dyn SessionListener>,
    flow_control: Arc<dyn FlowControlStrategy>,
    flusher: Flusher,
    creator: StreamCreator,
    streams: Mutex<HashMap<u32, Arc<Stream>>>,
    local_stream_ids: AtomicU32,
    last_remote_stream_id: AtomicI32,
    local_stream_count: AtomicI32,
    /// Packed pair: remote stream count in the high half, remote closing
    /// count in the low half, so admission check and increment are one CAS.
    remote_stream_count: AtomicU64,
    send_window: AtomicI32,
    recv_window: AtomicI32,
    closed: AtomicU8,
    bytes_written: AtomicU64,
    max_local_streams: AtomicI32,
    max_remote_streams: AtomicI32,
    push_enabled: AtomicBool,
    idle_time: Mutex<Instant>,
    close_frame: Mutex<Option<GoAwayFrame>>,
    config: SessionConfig,
}

impl Session {
    pub fn builder(role: SessionRole, endpoint: Arc<dyn Endpoint>) -> SessionBuilder {
        SessionBuilder::new(role, endpoint)
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    // ── Component access ───────────────────────────────────────────────

    pub(crate) fn generator(&self) -> &Generator {
        &self.generator
    }

    pub(crate) fn flow_control(&self) -> &Arc<dyn FlowControlStrategy> {
        &self.flow_control
    }

    pub(crate) fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub(crate) fn flusher(&self) -> &Flusher {
        &self.flusher
    }

    pub(crate) fn write_threshold(&self) -> usize {
        self.config.write_threshold
    }

    // ── Windows and counters ───────────────────────────────────────────

    pub fn send_window(&self) -> i32 {
        self.send_window.load(Ordering::Acquire)
    }

    pub fn recv_window(&self) -> i32 {
        self.recv_window.load(Ordering::Acquire)
    }

    /// Add `delta` to the session send window, returning the previous value.
    pub fn update_send_window(&self, delta: i32) -> i32 {
        self.send_window.fetch_add(delta, Ordering::AcqRel)
    }

    /// Add `delta` to the session receive window, returning the previous
    /// value.
    pub fn update_recv_window(&self, delta: i32) -> i32 {
        self.recv_window.fetch_add(delta, Ordering::AcqRel)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    pub(crate) fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn is_push_enabled(&self) -> bool {
        self.push_enabled.load(Ordering::Acquire)
    }

    pub fn last_remote_stream_id(&self) -> i32 {
        self.last_remote_stream_id.load(Ordering::Acquire)
    }

    fn update_last_remote_stream_id(&self, stream_id: u32) {
        self.last_remote_stream_id
            .fetch_max(stream_id as i32, Ordering::AcqRel);
    }

    pub(crate) fn next_local_stream_id(&self) -> u32 {
        self.local_stream_ids.fetch_add(2, Ordering::AcqRel)
    }

    // ── Closed vs. unknown stream ids ──────────────────────────────────

    fn is_local_stream_id(&self, stream_id: u32) -> bool {
        (stream_id & 1) == (self.local_stream_ids.load(Ordering::Acquire) & 1)
    }

    fn is_local_stream_closed(&self, stream_id: u32) -> bool {
        stream_id <= self.local_stream_ids.load(Ordering::Acquire)
    }

    fn is_remote_stream_closed(&self, stream_id: u32) -> bool {
        stream_id as i32 <= self.last_remote_stream_id()
    }

    /// An id at or below the last issued id on its side, absent from the
    /// table, is closed; anything beyond is unknown.
    pub(crate) fn is_stream_closed(&self, stream_id: u32) -> bool {
        if self.is_local_stream_id(stream_id) {
            self.is_local_stream_closed(stream_id)
        } else {
            self.is_remote_stream_closed(stream_id)
        }
    }

    // ── Stream table ───────────────────────────────────────────────────

    pub fn stream(&self, stream_id: u32) -> Option<Arc<Stream>> {
        self.streams.lock().expect("streams lock").get(&stream_id).cloned()
    }

    pub fn streams(&self) -> Vec<Arc<Stream>> {
        self.streams
            .lock()
            .expect("streams lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().expect("streams lock").len()
    }

    pub(crate) fn create_local_stream(&self, stream_id: u32) -> Result<Arc<Stream>, SessionError> {
        loop {
            let local_count = self.local_stream_count.load(Ordering::Acquire);
            let max_count = self.max_local_streams.load(Ordering::Acquire);
            if max_count >= 0 && local_count >= max_count {
                return Err(SessionError::InvalidState(format!(
                    "max local stream count {max_count} exceeded"
                )));
            }
            if self
                .local_stream_count
                .compare_exchange(
                    local_count,
                    local_count + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }

        let stream = Stream::new(stream_id, true);
        let inserted = match self.streams.lock().expect("streams lock").entry(stream_id) {
            MapEntry::Vacant(slot) => {
                slot.insert(stream.clone());
                true
            }
            MapEntry::Occupied(_) => false,
        };
        if inserted {
            stream.set_idle_timeout(self.config.stream_idle_timeout);
            self.flow_control.on_stream_created(&stream);
            metrics::LOCAL_STREAMS_OPENED.increment();
            debug!(stream = stream_id, "created local stream");
            Ok(stream)
        } else {
            self.local_stream_count.fetch_sub(1, Ordering::AcqRel);
            Err(SessionError::InvalidState(format!(
                "duplicate stream {stream_id}"
            )))
        }
    }

    pub(crate) fn create_remote_stream(self: &Arc<Self>, stream_id: u32) -> Option<Arc<Stream>> {
        // Exceeding max concurrent streams is a stream error: refuse the
        // stream, keep the session.
        loop {
            let encoded = self.remote_stream_count.load(Ordering::Acquire);
            let (remote_count, remote_closing) = unpack(encoded);
            let max_count = self.max_remote_streams.load(Ordering::Acquire);
            if max_count >= 0 && remote_count - remote_closing >= max_count {
                self.update_last_remote_stream_id(stream_id);
                metrics::STREAMS_REFUSED.increment();
                self.reset(
                    ResetFrame::new(stream_id, ErrorCode::RefusedStream),
                    Callback::noop(),
                );
                return None;
            }
            if self
                .remote_stream_count
                .compare_exchange(
                    encoded,
                    pack(remote_count + 1, remote_closing),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }

        let stream = Stream::new(stream_id, false);

        // A duplicate remote stream is a connection error.
        let inserted = match self.streams.lock().expect("streams lock").entry(stream_id) {
            MapEntry::Vacant(slot) => {
                slot.insert(stream.clone());
                true
            }
            MapEntry::Occupied(_) => false,
        };
        if inserted {
            self.update_last_remote_stream_id(stream_id);
            stream.set_idle_timeout(self.config.stream_idle_timeout);
            self.flow_control.on_stream_created(&stream);
            metrics::REMOTE_STREAMS_OPENED.increment();
            debug!(stream = stream_id, "created remote stream");
            Some(stream)
        } else {
            self.update_stream_count(false, -1, 0);
            self.on_connection_failure_with(ErrorCode::ProtocolError, "duplicate_stream", Callback::noop());
            None
        }
    }

    /// The only mutation path for the stream/closing counters; invoked by
    /// the stream close sub-machine.
    pub(crate) fn update_stream_count(&self, local: bool, delta_streams: i32, delta_closing: i32) {
        if local {
            self.local_stream_count
                .fetch_add(delta_streams, Ordering::AcqRel);
        } else {
            loop {
                let encoded = self.remote_stream_count.load(Ordering::Acquire);
                let (count, closing) = unpack(encoded);
                if self
                    .remote_stream_count
                    .compare_exchange(
                        encoded,
                        pack(count + delta_streams, closing + delta_closing),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    pub(crate) fn remove_stream(&self, stream: &Arc<Stream>) {
        let removed = self
            .streams
            .lock()
            .expect("streams lock")
            .remove(&stream.id());
        if removed.is_some() {
            self.flow_control.on_stream_destroyed(stream);
            metrics::STREAMS_CLOSED.increment();
            debug!(
                stream = stream.id(),
                local = stream.is_local(),
                "removed stream"
            );
        }
    }

    pub(crate) fn on_stream_opened(&self, stream: &Arc<Stream>) {
        trace!(stream = stream.id(), "stream opened");
    }

    // ── Application API ────────────────────────────────────────────────

    /// Open a locally-initiated stream. The promise completes with the
    /// stream once its HEADERS reached the transport; HEADERS of concurrent
    /// `new_stream` calls go on the wire in strictly increasing stream-id
    /// order. A `frame.stream_id` of 0 allocates the next id.
    pub fn new_stream(
        self: &Arc<Self>,
        frame: HeadersFrame,
        promise: Promise<Arc<Stream>>,
        listener: Option<Arc<dyn StreamListener>>,
    ) {
        self.creator.new_stream(self, frame, promise, listener);
    }

    /// Send a PRIORITY frame; allocates and returns the stream id when
    /// `frame.stream_id` is 0.
    pub fn priority(self: &Arc<Self>, frame: PriorityFrame, callback: Callback) -> u32 {
        self.creator.priority(self, frame, callback)
    }

    /// Reserve a pushed stream. The promised stream id is allocated by the
    /// session; the pushed stream is implicitly remotely closed once the
    /// PUSH_PROMISE is sent.
    pub fn push(
        self: &Arc<Self>,
        frame: PushPromiseFrame,
        promise: Promise<Arc<Stream>>,
        listener: Option<Arc<dyn StreamListener>>,
    ) {
        self.creator.push(self, frame, promise, listener);
    }

    /// Send a SETTINGS frame.
    pub fn settings(self: &Arc<Self>, frame: SettingsFrame, callback: Callback) {
        self.control(None, Frame::Settings(frame), callback);
    }

    /// Enlarge the session receive window to the configured initial size,
    /// queueing the WINDOW_UPDATE that advertises it. Invoked by the
    /// connection once the preface SETTINGS are queued.
    pub fn advertise_session_recv_window(self: &Arc<Self>) {
        let delta = self.config.initial_session_recv_window - DEFAULT_WINDOW_SIZE;
        if delta > 0 {
            self.update_recv_window(delta);
            self.control(
                None,
                Frame::WindowUpdate(WindowUpdateFrame::new(0, delta)),
                Callback::noop(),
            );
        }
    }

    /// Send a PING. Reply frames are rejected; replies are emitted by the
    /// engine alone.
    pub fn ping(self: &Arc<Self>, frame: PingFrame, callback: Callback) {
        if frame.reply {
            callback.failed(SessionError::InvalidArgument("ping reply"));
        } else {
            self.control(None, Frame::Ping(frame), callback);
        }
    }

    /// Reset a stream (request cancellation).
    pub fn reset(self: &Arc<Self>, frame: ResetFrame, callback: Callback) {
        let stream = self.stream(frame.stream_id);
        self.control(stream, Frame::Reset(frame), callback);
    }

    /// Send DATA on a stream. The callback fires once, when the last byte
    /// reached the transport; flow-control fragmentation fires no
    /// intermediate completions.
    pub fn data(self: &Arc<Self>, stream: Arc<Stream>, frame: DataFrame, callback: Callback) {
        self.frame(Entry::data(frame, stream, callback), true);
    }

    pub(crate) fn control(self: &Arc<Self>, stream: Option<Arc<Stream>>, frame: Frame, callback: Callback) {
        self.frames(stream, frame, Vec::new(), callback);
    }

    /// Queue `frame` and `more` for sending; the callback completes when
    /// the last of them reached the transport.
    pub fn frames(
        self: &Arc<Self>,
        stream: Option<Arc<Stream>>,
        frame: Frame,
        more: Vec<Frame>,
        callback: Callback,
    ) {
        // Generation happens as late as possible, while the flusher drains.
        if more.is_empty() {
            self.frame(Entry::control(frame, stream, callback), true);
        } else {
            let count = 1 + more.len();
            let counting = Arc::new(CountingCallback::new(callback, count));
            self.frame(
                Entry::control(frame, stream.clone(), fork(&counting)),
                false,
            );
            let last = more.len();
            for (index, frame) in more.into_iter().enumerate() {
                self.frame(
                    Entry::control(frame, stream.clone(), fork(&counting)),
                    index + 1 == last,
                );
            }
        }
    }

    fn frame(self: &Arc<Self>, entry: Entry, flush: bool) {
        trace!(frame = ?entry.frame_type(), flush, "queueing frame");
        let stream = entry.stream().cloned();
        // Ping frames are prepended to process them as soon as possible.
        let queued = if entry.frame_type() == FrameType::Ping {
            self.flusher.prepend(self, entry)
        } else {
            self.flusher.append(self, entry)
        };
        if queued && flush {
            if let Some(stream) = stream {
                stream.not_idle();
            }
            self.flusher.iterate(self);
        }
    }

    // ── Close machine ──────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.closed.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::NotClosed
    }

    pub fn is_disconnected(&self) -> bool {
        !self.endpoint.is_open()
    }

    /// The GO_AWAY that caused the close, if any.
    pub fn close_frame(&self) -> Option<GoAwayFrame> {
        self.close_frame.lock().expect("session lock").clone()
    }

    /// Initiate a close: send GO_AWAY, then shut down the write half once
    /// it is flushed. Returns true iff this call initiated the close; later
    /// calls succeed their callback immediately and return false.
    pub fn close(self: &Arc<Self>, error: ErrorCode, reason: Option<&str>, callback: Callback) -> bool {
        loop {
            let current = self.state();
            match current {
                SessionState::NotClosed => {
                    if self.cas_state(current, SessionState::LocallyClosed) {
                        let frame = self.new_go_away(error, reason);
                        *self.close_frame.lock().expect("session lock") = Some(frame.clone());
                        self.control(None, Frame::GoAway(frame), callback);
                        return true;
                    }
                }
                _ => {
                    debug!(?error, reason, "ignoring close, already closed");
                    callback.succeeded();
                    return false;
                }
            }
        }
    }

    /// Orderly service stop: close, then disconnect once the GO_AWAY flush
    /// completes either way.
    pub fn stop(self: &Arc<Self>) {
        let session = self.clone();
        let callback = Callback::new(move |_| session.disconnect());
        let _ = self.close(ErrorCode::NoError, Some("stop"), callback);
    }

    fn new_go_away(&self, error: ErrorCode, reason: Option<&str>) -> GoAwayFrame {
        // Trim the reason to avoid attack vectors.
        let payload = reason.map(|reason| Bytes::copy_from_slice(truncate_reason(reason).as_bytes()));
        GoAwayFrame {
            last_stream_id: self.last_remote_stream_id(),
            error,
            payload,
        }
    }

    fn cas_state(&self, current: SessionState, next: SessionState) -> bool {
        self.closed
            .compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Transport FIN (or read exception). A peer that honored our GO_AWAY
    /// closes its side; a FIN with no close in flight is an abrupt close.
    pub fn on_shutdown(self: &Arc<Self>) {
        debug!(state = ?self.state(), "transport shutdown");
        match self.state() {
            SessionState::NotClosed => {
                // The other peer did not send a GO_AWAY, no need to be
                // gentle.
                self.abort(SessionError::ClosedChannel);
            }
            SessionState::LocallyClosed => {
                // Our GO_AWAY only shut down the output; queue a disconnect
                // to close the connection.
                self.control(None, Frame::Disconnect, Callback::noop());
            }
            // The GO_AWAY we received will close the connection.
            SessionState::RemotelyClosed | SessionState::Closed => {}
        }
    }

    /// Idle timer fired. Returns the listener's verdict (true = the caller
    /// should close the session) when genuinely idle and not closed; a
    /// timeout during a close in flight aborts.
    pub fn on_idle_timeout(self: &Arc<Self>) -> bool {
        match self.state() {
            SessionState::NotClosed => {
                let elapsed = self.idle_time.lock().expect("session lock").elapsed();
                if elapsed < self.endpoint.idle_timeout() {
                    return false;
                }
                self.notify_idle_timeout()
            }
            SessionState::LocallyClosed | SessionState::RemotelyClosed => {
                self.abort(SessionError::IdleTimeout(
                    self.endpoint.idle_timeout().as_millis() as u64,
                ));
                false
            }
            SessionState::Closed => false,
        }
    }

    pub(crate) fn not_idle(&self) {
        *self.idle_time.lock().expect("session lock") = Instant::now();
    }

    // ── Failure orchestration ──────────────────────────────────────────

    pub(crate) fn on_connection_failure_with(
        self: &Arc<Self>,
        error: ErrorCode,
        reason: &str,
        callback: Callback,
    ) {
        let failure = SessionError::protocol(error, reason);
        metrics::CONNECTION_FAILURES.increment();
        debug!(%failure, "session failure");
        // Once every stream and the listener observed the failure, drive
        // GO_AWAY transmission followed by disconnect.
        let session = self.clone();
        let reason = reason.to_string();
        let sequel = Callback::new(move |_| {
            let _ = session.close(error, Some(&reason), callback);
        });
        self.fan_out_failure(error, &failure, sequel);
    }

    /// Unrecoverable transport fault: fail streams, then terminate without
    /// a GO_AWAY.
    pub(crate) fn abort(self: &Arc<Self>, failure: SessionError) {
        debug!(%failure, "session abort");
        let session = self.clone();
        let cause = failure.clone();
        let sequel = Callback::new(move |_| session.terminate(cause.clone()));
        self.fan_out_failure(ErrorCode::NoError, &failure, sequel);
    }

    /// Deliver a synthetic failure frame to every open stream; `sequel`
    /// runs only after all streams and the session listener have observed
    /// the failure.
    fn fan_out_failure(self: &Arc<Self>, error: ErrorCode, failure: &SessionError, sequel: Callback) {
        let streams = self.streams();
        let counting = Arc::new(CountingCallback::new(sequel, streams.len() + 1));
        for stream in streams {
            let frame = Frame::Failure(FailureFrame {
                error,
                reason: failure.to_string(),
                cause: failure.clone(),
            });
            stream.process(self, &frame, fork(&counting));
        }
        self.notify_failure(failure, fork(&counting));
    }

    /// CAS to `Closed` from any state, fail queued writes, close every
    /// stream, clear the table, close the endpoint. Idempotent.
    pub(crate) fn terminate(self: &Arc<Self>, cause: SessionError) {
        loop {
            let current = self.state();
            if current == SessionState::Closed {
                return;
            }
            if self.cas_state(current, SessionState::Closed) {
                self.flusher.terminate(self, cause.clone());
                let streams: Vec<Arc<Stream>> = {
                    let mut table = self.streams.lock().expect("streams lock");
                    table.drain().map(|(_, stream)| stream).collect()
                };
                for stream in &streams {
                    stream.close(self);
                }
                self.disconnect();
                return;
            }
        }
    }

    pub fn disconnect(&self) {
        debug!("disconnecting");
        self.endpoint.close();
    }

    /// Transport notification that `bytes` were flushed.
    pub fn on_flushed(&self, bytes: u64) {
        self.flusher.on_flushed(bytes);
    }

    // ── Ingress helpers ────────────────────────────────────────────────

    pub(crate) fn on_data_with(self: &Arc<Self>, frame: DataFrame, callback: Callback) {
        debug!(stream = frame.stream_id, len = frame.remaining(), "received data");
        metrics::FRAMES_RECEIVED.increment();
        self.not_idle();

        let stream_id = frame.stream_id;
        let stream = self.stream(stream_id);

        // The session window is debited even when the stream is absent, so
        // a flood on dead streams cannot starve live ones. The flow control
        // length includes the padding bytes.
        let flow_length = frame.flow_control_length();
        self.flow_control
            .on_data_received(self, stream.as_ref(), flow_length);

        match stream {
            Some(stream) => {
                if self.recv_window() < 0 {
                    self.on_connection_failure_with(
                        ErrorCode::FlowControlError,
                        "session_window_exceeded",
                        callback,
                    );
                } else {
                    // Completion returns the credit, also on failure, so
                    // the session window frees up for other streams.
                    let session = self.clone();
                    let credited = stream.clone();
                    let data_callback = Callback::new(move |result| {
                        session.not_idle();
                        credited.not_idle();
                        session.flow_control.on_data_consumed(
                            &session,
                            Some(&credited),
                            flow_length,
                        );
                        callback.complete(result);
                    });
                    stream.process(self, &Frame::Data(frame), data_callback);
                }
            }
            None => {
                debug!(stream = stream_id, "stream not found");
                // Return the session credit regardless.
                self.flow_control.on_data_consumed(self, None, flow_length);
                if self.is_stream_closed(stream_id) {
                    self.reset(ResetFrame::new(stream_id, ErrorCode::StreamClosed), callback);
                } else {
                    self.on_connection_failure_with(
                        ErrorCode::ProtocolError,
                        "unexpected_data_frame",
                        callback,
                    );
                }
            }
        }
    }

    /// Apply a SETTINGS frame; `reply` controls whether the acknowledgement
    /// is queued (the acknowledgement follows application, so a peer
    /// observing it may rely on the new values).
    pub fn on_settings_with(self: &Arc<Self>, frame: SettingsFrame, reply: bool) {
        debug!(reply = frame.reply, count = frame.settings.len(), "received settings");
        metrics::FRAMES_RECEIVED.increment();
        self.not_idle();

        if frame.reply {
            return;
        }

        for (key, value) in &frame.settings {
            match *key {
                settings::HEADER_TABLE_SIZE => {
                    debug!(value, "updating header table size");
                    self.generator.set_header_table_size(*value);
                }
                settings::ENABLE_PUSH => {
                    let enabled = *value == 1;
                    debug!(enabled, "updating push");
                    self.push_enabled.store(enabled, Ordering::Release);
                }
                settings::MAX_CONCURRENT_STREAMS => {
                    debug!(value, "updating max local concurrent streams");
                    self.max_local_streams.store(*value as i32, Ordering::Release);
                }
                settings::INITIAL_WINDOW_SIZE => {
                    debug!(value, "updating initial stream window");
                    self.flow_control
                        .update_initial_stream_window(self, *value, false);
                }
                settings::MAX_FRAME_SIZE => {
                    debug!(value, "updating max frame size");
                    self.generator.set_max_frame_size(*value);
                }
                settings::MAX_HEADER_LIST_SIZE => {
                    debug!(value, "updating max header list size");
                    self.generator.set_max_header_list_size(*value);
                }
                unknown => {
                    debug!(id = unknown, value, "ignoring unknown setting");
                }
            }
        }
        self.notify_settings(&frame);

        if reply {
            self.settings(SettingsFrame::reply(), Callback::noop());
        }
    }

    /// Route a window update through the flusher, the sole owner of
    /// send-window adjustments during writes.
    pub(crate) fn route_window_update(
        self: &Arc<Self>,
        stream: Option<Arc<Stream>>,
        frame: WindowUpdateFrame,
    ) {
        self.flusher.window(self, stream, frame);
    }

    // ── Listener notification ──────────────────────────────────────────

    pub(crate) fn notify_new_stream(
        self: &Arc<Self>,
        stream: &Arc<Stream>,
        frame: &HeadersFrame,
    ) -> Option<Arc<dyn StreamListener>> {
        self.listener.on_new_stream(stream, frame)
    }

    fn notify_settings(&self, frame: &SettingsFrame) {
        self.listener.on_settings(self, frame);
    }

    fn notify_ping(&self, frame: &PingFrame) {
        self.listener.on_ping(self, frame);
    }

    fn notify_reset(&self, frame: &ResetFrame) {
        self.listener.on_reset(self, frame);
    }

    fn notify_close(&self, frame: &GoAwayFrame, callback: Callback) {
        self.listener.on_close(self, frame, callback);
    }

    fn notify_idle_timeout(&self) -> bool {
        self.listener.on_idle_timeout(self)
    }

    fn notify_failure(&self, failure: &SessionError, callback: Callback) {
        self.listener.on_failure(self, failure, callback);
    }

    // ── Introspection ──────────────────────────────────────────────────

    /// One-line session summary followed by one line per stream.
    pub fn dump(&self) -> String {
        let mut out = format!("{self:?}");
        for stream in self.streams() {
            out.push_str("\n  ");
            out.push_str(&format!("{stream:?}"));
        }
        out
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Session{{{:?},send_window={},recv_window={},streams={},{:?}}}",
            self.role,
            self.send_window(),
            self.recv_window(),
            self.stream_count(),
            self.state(),
        )
    }
}

// ── Ingress dispatch ───────────────────────────────────────────────────

impl FrameListener for Arc<Session> {
    fn on_data(&self, frame: DataFrame) {
        self.on_data_with(frame, Callback::noop());
    }

    fn on_headers(&self, frame: HeadersFrame) {
        debug!(stream = frame.stream_id, end_stream = frame.end_stream, "received headers");
        metrics::FRAMES_RECEIVED.increment();
        self.not_idle();
        self.role().on_headers(self, frame);
    }

    fn on_priority(&self, frame: PriorityFrame) {
        // No dependency tree is maintained; accepted as a notification.
        debug!(stream = frame.stream_id, parent = frame.parent_stream_id, "received priority");
        metrics::FRAMES_RECEIVED.increment();
        self.not_idle();
    }

    fn on_reset(&self, frame: ResetFrame) {
        debug!(stream = frame.stream_id, error = ?frame.error, "received reset");
        metrics::FRAMES_RECEIVED.increment();
        self.not_idle();
        match self.stream(frame.stream_id) {
            Some(stream) => {
                // Resume writes once the application observed the reset.
                let session = self.clone();
                let callback = Callback::new(move |_| session.flusher.iterate(&session));
                stream.process(self, &Frame::Reset(frame), callback);
            }
            None => {
                if self.is_stream_closed(frame.stream_id) {
                    self.notify_reset(&frame);
                } else {
                    self.on_connection_failure_with(
                        ErrorCode::ProtocolError,
                        "unexpected_rst_stream_frame",
                        Callback::noop(),
                    );
                }
            }
        }
    }

    fn on_settings(&self, frame: SettingsFrame) {
        // SETTINGS frames must be replied.
        self.on_settings_with(frame, true);
    }

    fn on_push_promise(&self, frame: PushPromiseFrame) {
        debug!(
            stream = frame.stream_id,
            promised = frame.promised_stream_id,
            "received push promise"
        );
        metrics::FRAMES_RECEIVED.increment();
        self.not_idle();
        self.role().on_push_promise(self, frame);
    }

    fn on_ping(&self, frame: PingFrame) {
        debug!(reply = frame.reply, "received ping");
        metrics::FRAMES_RECEIVED.increment();
        self.not_idle();
        if frame.reply {
            self.notify_ping(&frame);
        } else {
            let reply = PingFrame {
                payload: frame.payload,
                reply: true,
            };
            self.control(None, Frame::Ping(reply), Callback::noop());
        }
    }

    fn on_go_away(&self, frame: GoAwayFrame) {
        debug!(
            last_stream = frame.last_stream_id,
            error = ?frame.error,
            "received go_away"
        );
        metrics::FRAMES_RECEIVED.increment();
        self.not_idle();
        loop {
            let current = self.state();
            match current {
                SessionState::NotClosed => {
                    if self.cas_state(current, SessionState::RemotelyClosed) {
                        // Write what's in the queue, then disconnect.
                        *self.close_frame.lock().expect("session lock") = Some(frame.clone());
                        let session = self.clone();
                        let disconnect = Callback::new(move |_| {
                            session.control(None, Frame::Disconnect, Callback::noop());
                        });
                        self.notify_close(&frame, disconnect);
                        return;
                    }
                }
                _ => {
                    debug!("ignored go_away, already closed");
                    return;
                }
            }
        }
    }

    fn on_window_update(&self, frame: WindowUpdateFrame) {
        debug!(stream = frame.stream_id, delta = frame.delta, "received window update");
        metrics::FRAMES_RECEIVED.increment();
        self.not_idle();
        let stream_id = frame.stream_id;
        if stream_id > 0 {
            match self.stream(stream_id) {
                Some(stream) => {
                    let stream_window = stream.update_send_window(0);
                    if stream_window.checked_add(frame.delta).is_none() {
                        // Overflow on one stream resets that stream only.
                        self.reset(
                            ResetFrame::new(stream_id, ErrorCode::FlowControlError),
                            Callback::noop(),
                        );
                    } else {
                        stream.process(self, &Frame::WindowUpdate(frame), Callback::noop());
                        self.route_window_update(Some(stream), frame);
                    }
                }
                None => {
                    if !self.is_stream_closed(stream_id) {
                        self.on_connection_failure_with(
                            ErrorCode::ProtocolError,
                            "unexpected_window_update_frame",
                            Callback::noop(),
                        );
                    }
                }
            }
        } else {
            let session_window = self.send_window();
            if session_window.checked_add(frame.delta).is_none() {
                self.on_connection_failure_with(
                    ErrorCode::FlowControlError,
                    "invalid_flow_control_window",
                    Callback::noop(),
                );
            } else {
                self.route_window_update(None, frame);
            }
        }
    }

    fn on_stream_failure(&self, stream_id: u32, error: ErrorCode, reason: &str) {
        let failure = SessionError::protocol(error, reason);
        debug!(stream = stream_id, %failure, "stream failure");
        // Chain the RST_STREAM after the stream observed the failure.
        let session = self.clone();
        let callback =
            Callback::new(move |_| session.reset(ResetFrame::new(stream_id, error), Callback::noop()));
        match self.stream(stream_id) {
            Some(stream) => {
                let frame = Frame::Failure(FailureFrame {
                    error,
                    reason: reason.to_string(),
                    cause: failure,
                });
                stream.process(self, &frame, callback);
            }
            None => callback.succeeded(),
        }
    }

    fn on_connection_failure(&self, error: ErrorCode, reason: &str) {
        self.on_connection_failure_with(error, reason, Callback::noop());
    }

    fn on_frame(&self, frame: Frame) {
        debug!(frame = ?frame.frame_type(), "received non-HTTP/2 frame");
        self.on_connection_failure_with(ErrorCode::ProtocolError, "upgrade", Callback::noop());
    }
}

// ── Helpers ────────────────────────────────────────────────────────────

/// One participant's completion token for a counting fan-out.
fn fork(counting: &Arc<CountingCallback>) -> Callback {
    let counting = counting.clone();
    Callback::new(move |result| match result {
        Ok(()) => counting.succeeded(),
        Err(cause) => counting.failed(cause),
    })
}

fn pack(count: i32, closing: i32) -> u64 {
    ((count as u32 as u64) << 32) | (closing as u32 as u64)
}

fn unpack(encoded: u64) -> (i32, i32) {
    ((encoded >> 32) as u32 as i32, encoded as u32 as i32)
}

/// Truncate a GO_AWAY reason to at most 32 UTF-8 bytes, on a char boundary.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= 32 {
        return reason;
    }
    let mut end = 32;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_pair_round_trip() {
        let encoded = pack(7, 3);
        assert_eq!(unpack(encoded), (7, 3));
        let encoded = pack(0, 0);
        assert_eq!(unpack(encoded), (0, 0));
        // Negative intermediate values survive the packing.
        let encoded = pack(-1, -1);
        assert_eq!(unpack(encoded), (-1, -1));
    }

    #[test]
    fn reason_truncation_is_byte_bounded() {
        assert_eq!(truncate_reason("short"), "short");
        let long = "x".repeat(64);
        assert_eq!(truncate_reason(&long).len(), 32);
        // Multi-byte chars are not split.
        let accented = "é".repeat(20); // 40 bytes
        let truncated = truncate_reason(&accented);
        assert!(truncated.len() <= 32);
        assert!(truncated.is_char_boundary(truncated.len()));
    }
}
