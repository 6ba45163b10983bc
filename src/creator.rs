//! Stream-id allocator and send-ordering queue.
//!
//! Stream ids must be monotonically increasing on the wire (the header
//! codec's state depends on HEADERS order). Allocation atomically pairs the
//! id fetch with a reserved slot in a FIFO, so the queue order equals the
//! id order; the possibly-blocking work of building the stream happens
//! outside the critical section. Concurrent threads only flush up to the
//! first slot whose entry has not been set yet; the thread that fills that
//! slot finishes the drain, so frames leave strictly in stream-id order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use crate::api::StreamListener;
use crate::callback::{Callback, Promise};
use crate::entry::Entry;
use crate::error::SessionError;
use crate::frame::{Frame, HeadersFrame, PriorityFrame, PushPromiseFrame};
use crate::session::Session;
use crate::stream::Stream;

/// A reserved position in the FIFO. The entry is set once the caller has
/// built its stream; a slot without an entry blocks the drain behind it.
struct Slot {
    entry: Mutex<Option<Entry>>,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            entry: Mutex::new(None),
        })
    }

    fn set_entry(&self, entry: Entry) {
        *self.entry.lock().expect("slot lock") = Some(entry);
    }

    fn take_entry(&self) -> Option<Entry> {
        self.entry.lock().expect("slot lock").take()
    }
}

struct State {
    slots: VecDeque<Arc<Slot>>,
    flushing: bool,
}

pub(crate) struct StreamCreator {
    state: Mutex<State>,
}

impl StreamCreator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                slots: VecDeque::new(),
                flushing: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("creator lock")
    }

    pub fn new_stream(
        &self,
        session: &Arc<Session>,
        frame: HeadersFrame,
        promise: Promise<Arc<Stream>>,
        listener: Option<Arc<dyn StreamListener>>,
    ) {
        let slot = Slot::new();
        let current_stream_id = frame.stream_id;
        let stream_id = self.reserve_slot(session, &slot, current_stream_id);

        let mut frame = frame;
        if current_stream_id == 0 {
            frame.stream_id = stream_id;
            if let Some(priority) = &mut frame.priority {
                priority.stream_id = stream_id;
            }
        }

        self.create_local_stream(session, &slot, Frame::Headers(frame), promise, listener, stream_id);
    }

    pub fn push(
        &self,
        session: &Arc<Session>,
        frame: PushPromiseFrame,
        promise: Promise<Arc<Stream>>,
        listener: Option<Arc<dyn StreamListener>>,
    ) {
        let slot = Slot::new();
        let stream_id = self.reserve_slot(session, &slot, 0);

        let mut frame = frame;
        frame.promised_stream_id = stream_id;

        self.create_local_stream(session, &slot, Frame::PushPromise(frame), promise, listener, stream_id);
    }

    pub fn priority(
        &self,
        session: &Arc<Session>,
        frame: PriorityFrame,
        callback: Callback,
    ) -> u32 {
        let slot = Slot::new();
        let current_stream_id = frame.stream_id;
        let stream_id = self.reserve_slot(session, &slot, current_stream_id);

        let mut frame = frame;
        if current_stream_id == 0 {
            frame.stream_id = stream_id;
        }

        slot.set_entry(Entry::control(Frame::Priority(frame), None, callback));
        self.flush(session);
        stream_id
    }

    /// Atomically allocate the next id (when the caller has none) and
    /// append the slot, under one short critical section so queue order
    /// equals id order.
    fn reserve_slot(&self, session: &Session, slot: &Arc<Slot>, stream_id: u32) -> u32 {
        let mut state = self.lock();
        let stream_id = if stream_id == 0 {
            session.next_local_stream_id()
        } else {
            stream_id
        };
        state.slots.push_back(slot.clone());
        stream_id
    }

    fn create_local_stream(
        &self,
        session: &Arc<Session>,
        slot: &Arc<Slot>,
        frame: Frame,
        promise: Promise<Arc<Stream>>,
        listener: Option<Arc<dyn StreamListener>>,
        stream_id: u32,
    ) {
        match session.create_local_stream(stream_id) {
            Ok(stream) => {
                stream.set_listener(listener);
                let completed = stream.clone();
                let callback = Callback::new(move |result| match result {
                    Ok(()) => promise.succeeded(completed),
                    Err(cause) => promise.failed(cause),
                });
                slot.set_entry(Entry::control(frame, Some(stream), callback));
                self.flush(session);
            }
            Err(cause) => self.free_slot_and_fail(session, slot, promise, cause),
        }
    }

    fn free_slot_and_fail(
        &self,
        session: &Arc<Session>,
        slot: &Arc<Slot>,
        promise: Promise<Arc<Stream>>,
        cause: SessionError,
    ) {
        {
            let mut state = self.lock();
            state.slots.retain(|queued| !Arc::ptr_eq(queued, slot));
        }
        // Let any trailing entries progress.
        self.flush(session);
        promise.failed(cause);
    }

    /// Drain slots in order, forwarding entries to the flusher, stopping at
    /// the first slot still lacking its entry: the concurrent submitter
    /// that fills it will finish the drain. Only one thread drains at a
    /// time; it is safe for every thread to call flush after setting its
    /// entry.
    fn flush(&self, session: &Arc<Session>) {
        let mut queued = false;
        let mut claimed = false;
        loop {
            let entry = {
                let mut state = self.lock();
                if !claimed {
                    if state.flushing {
                        return; // another thread is flushing
                    }
                    state.flushing = true;
                    claimed = true;
                }
                match state.slots.front().and_then(|slot| slot.take_entry()) {
                    Some(entry) => {
                        state.slots.pop_front();
                        Some(entry)
                    }
                    None => {
                        // No more slots, or a slot not yet filled.
                        state.flushing = false;
                        None
                    }
                }
            };
            match entry {
                Some(entry) => {
                    trace!(frame = ?entry.frame_type(), "creator forwarding entry");
                    queued |= session.flusher().append(session, entry);
                }
                None => break,
            }
        }
        if queued {
            session.flusher().iterate(session);
        }
    }
}
