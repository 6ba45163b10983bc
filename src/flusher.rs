//! The write pump.
//!
//! One flusher per session drains queued entries to the endpoint. Whichever
//! thread finds the pump inactive claims it; everyone else marks it pending
//! and leaves, so exactly one thread writes at a time.
//!
//! The flusher is the sole owner of send-window adjustments: inbound
//! WINDOW_UPDATE frames (and initial-window deltas from SETTINGS) are
//! queued here and applied at the top of each pump round, so generation
//! decisions always see windows no other thread is moving. Entries that
//! cannot generate on an exhausted window are parked and retried when a
//! window update arrives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::entry::{Completion, Entry, Generated};
use crate::error::SessionError;
use crate::frame::WindowUpdateFrame;
use crate::session::Session;
use crate::stream::Stream;

struct State {
    entries: VecDeque<Entry>,
    stalled: Vec<Entry>,
    windows: VecDeque<(Option<Arc<Stream>>, WindowUpdateFrame)>,
    terminated: Option<SessionError>,
}

pub(crate) struct Flusher {
    state: Mutex<State>,
    active: AtomicBool,
    pending: AtomicBool,
}

impl Flusher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                stalled: Vec::new(),
                windows: VecDeque::new(),
                terminated: None,
            }),
            active: AtomicBool::new(false),
            pending: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("flusher lock")
    }

    /// Queue an entry. Returns false when the flusher is terminated, in
    /// which case the entry has been failed with the termination cause.
    pub fn append(&self, session: &Arc<Session>, entry: Entry) -> bool {
        let mut state = self.lock();
        if let Some(cause) = state.terminated.clone() {
            drop(state);
            entry.fail(session, cause);
            return false;
        }
        state.entries.push_back(entry);
        true
    }

    /// Queue an entry at the front; PINGs jump the line.
    pub fn prepend(&self, session: &Arc<Session>, entry: Entry) -> bool {
        let mut state = self.lock();
        if let Some(cause) = state.terminated.clone() {
            drop(state);
            entry.fail(session, cause);
            return false;
        }
        state.entries.push_front(entry);
        true
    }

    /// Hand a window update to the pump.
    pub fn window(&self, session: &Arc<Session>, stream: Option<Arc<Stream>>, frame: WindowUpdateFrame) {
        {
            let mut state = self.lock();
            if state.terminated.is_some() {
                return;
            }
            state.windows.push_back((stream, frame));
        }
        self.iterate(session);
    }

    /// Bytes reached the transport; observation hook for the session.
    pub fn on_flushed(&self, bytes: u64) {
        trace!(bytes, "flushed");
    }

    /// Wake the pump. The claiming thread drains; others leave their wakeup
    /// pending. The pending mark is set before the claim attempt so an
    /// active drainer observes it on its way out.
    pub fn iterate(&self, session: &Arc<Session>) {
        self.pending.store(true, Ordering::SeqCst);
        loop {
            if self.active.swap(true, Ordering::SeqCst) {
                return;
            }
            self.pending.store(false, Ordering::SeqCst);
            self.process(session);
            self.active.store(false, Ordering::SeqCst);
            if !self.pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Fail every queued entry and refuse new ones. Idempotent.
    pub fn terminate(&self, session: &Arc<Session>, cause: SessionError) {
        let drained: Vec<Entry> = {
            let mut state = self.lock();
            if state.terminated.is_some() {
                return;
            }
            state.terminated = Some(cause.clone());
            state.windows.clear();
            let mut drained: Vec<Entry> = state.entries.drain(..).collect();
            drained.append(&mut state.stalled);
            drained
        };
        debug!(%cause, entries = drained.len(), "flusher terminated");
        for entry in drained {
            entry.fail(session, cause.clone());
        }
    }

    /// One drain: apply window updates, generate until the write threshold,
    /// write, run success actions, repeat until nothing progresses.
    fn process(&self, session: &Arc<Session>) {
        loop {
            // Window updates first, so generation sees consistent windows.
            let windows: Vec<_> = {
                let mut state = self.lock();
                let windows: Vec<_> = state.windows.drain(..).collect();
                if !windows.is_empty() {
                    // A window may have opened; give parked entries
                    // another chance, ahead of newer entries.
                    for entry in state.stalled.drain(..).rev().collect::<Vec<_>>() {
                        state.entries.push_front(entry);
                    }
                }
                windows
            };
            for (stream, frame) in windows {
                match stream {
                    Some(stream) => {
                        if !stream.is_closed() {
                            let old = stream.update_send_window(frame.delta);
                            trace!(
                                stream = stream.id(),
                                old,
                                delta = frame.delta,
                                "stream send window updated"
                            );
                        }
                    }
                    None => {
                        let old = session.update_send_window(frame.delta);
                        trace!(old, delta = frame.delta, "session send window updated");
                    }
                }
            }

            let mut lease = BytesMut::new();
            let mut flushed: Vec<Entry> = Vec::new();
            loop {
                if lease.len() >= session.write_threshold() {
                    break;
                }
                let entry = {
                    let mut state = self.lock();
                    if !state.windows.is_empty() {
                        // New window updates arrived; apply them before
                        // generating more.
                        break;
                    }
                    state.entries.pop_front()
                };
                let Some(mut entry) = entry else { break };
                match entry.generate(session, &mut lease) {
                    Ok(Generated::Written) => flushed.push(entry),
                    Ok(Generated::Stalled) => self.lock().stalled.push(entry),
                    Err(cause) => {
                        debug!(%cause, frame = ?entry.frame_type(), "generation failed");
                        entry.fail(session, cause);
                    }
                }
            }

            if lease.is_empty() && flushed.is_empty() {
                return;
            }

            if !lease.is_empty() {
                let bytes = lease.len() as u64;
                if let Err(cause) = session.endpoint().write(&lease) {
                    let cause = SessionError::Io(cause.to_string());
                    for entry in flushed {
                        entry.fail(session, cause.clone());
                    }
                    session.abort(cause);
                    return;
                }
                self.on_flushed(bytes);
            }

            for mut entry in flushed {
                if entry.on_success(session) == Completion::Pending {
                    self.lock().entries.push_back(entry);
                }
            }
        }
    }
}
