//! Completion tokens for asynchronous operations.
//!
//! Every asynchronous session operation takes a [`Callback`] (or a
//! [`Promise`] when it produces a value) that is completed exactly once:
//! `succeeded` when the operation took effect, `failed` with the cause
//! otherwise. [`CountingCallback`] coordinates fan-out: it succeeds its
//! wrapped callback only after all participants have reported, and
//! short-circuits to failure on the first error.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::SessionError;

type Completion = Box<dyn FnOnce(Result<(), SessionError>) + Send>;

/// A one-shot completion token.
///
/// Completing a second time is a no-op, which lets failure paths complete
/// defensively without double-invoking user code.
pub struct Callback {
    inner: Mutex<Option<Completion>>,
}

impl Callback {
    pub fn new(f: impl FnOnce(Result<(), SessionError>) + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Some(Box::new(f))),
        }
    }

    /// A callback that discards its completion.
    pub fn noop() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn succeeded(&self) {
        self.complete(Ok(()));
    }

    pub fn failed(&self, cause: SessionError) {
        self.complete(Err(cause));
    }

    pub fn complete(&self, result: Result<(), SessionError>) {
        let f = self.inner.lock().expect("callback lock").take();
        if let Some(f) = f {
            f(result);
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Callback")
    }
}

/// A one-shot completion token producing a value.
pub struct Promise<T> {
    inner: Mutex<Option<Box<dyn FnOnce(Result<T, SessionError>) + Send>>>,
}

impl<T> Promise<T> {
    pub fn new(f: impl FnOnce(Result<T, SessionError>) + Send + 'static) -> Self {
        Self {
            inner: Mutex::new(Some(Box::new(f))),
        }
    }

    /// A promise that discards its completion.
    pub fn noop() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn succeeded(&self, value: T) {
        self.complete(Ok(value));
    }

    pub fn failed(&self, cause: SessionError) {
        self.complete(Err(cause));
    }

    pub fn complete(&self, result: Result<T, SessionError>) {
        let f = self.inner.lock().expect("promise lock").take();
        if let Some(f) = f {
            f(result);
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Promise")
    }
}

/// Succeeds `callback` after `count` successes; the first failure completes
/// it immediately and later reports are ignored.
pub struct CountingCallback {
    callback: Callback,
    count: AtomicUsize,
}

impl CountingCallback {
    pub fn new(callback: Callback, count: usize) -> Self {
        Self {
            callback,
            count: AtomicUsize::new(count),
        }
    }

    pub fn succeeded(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.callback.succeeded();
        }
    }

    pub fn failed(&self, cause: SessionError) {
        if self.count.swap(0, Ordering::AcqRel) > 0 {
            self.callback.failed(cause);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn callback_completes_once() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let cb = Callback::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        cb.succeeded();
        cb.succeeded();
        cb.failed(SessionError::ClosedChannel);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn counting_callback_waits_for_all() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let counting = CountingCallback::new(
            Callback::new(move |r| {
                assert!(r.is_ok());
                h.fetch_add(1, Ordering::SeqCst);
            }),
            3,
        );
        counting.succeeded();
        counting.succeeded();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        counting.succeeded();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn counting_callback_short_circuits_on_failure() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let counting = CountingCallback::new(
            Callback::new(move |r| {
                assert!(r.is_err());
                h.fetch_add(1, Ordering::SeqCst);
            }),
            3,
        );
        counting.succeeded();
        counting.failed(SessionError::protocol(ErrorCode::ProtocolError, "boom"));
        counting.succeeded();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn promise_delivers_value() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let promise = Promise::new(move |r: Result<u32, _>| {
            assert_eq!(r.unwrap(), 7);
            h.fetch_add(1, Ordering::SeqCst);
        });
        promise.succeeded(7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
