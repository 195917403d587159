//! Single-assignment result cells.
//!
//! A [`Promise`] is created pending, registered with its event loop, and
//! transitions exactly once to a value or a failure. Completion schedules
//! registered callbacks onto the loop's immediate queue in registration
//! order and wakes any tasklet awaiting the promise. Synchronous callers
//! drive the loop through [`Promise::wait`]; if the loop drains while
//! promises are still pending, every pending promise is failed with a
//! deadlock report instead of hanging the caller.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
        Waker,
    },
};

use errors::{
    reshare,
    ClientError,
};
use parking_lot::Mutex;

use crate::event_loop::{
    Callback,
    EventLoop,
    PendingEntry,
};

enum State<T> {
    Pending,
    Done(Result<T, Arc<anyhow::Error>>),
}

struct PromiseInner<T> {
    state: State<T>,
    callbacks: Vec<Callback>,
    wakers: Vec<Waker>,
}

/// A single-assignment result cell bound to an [`EventLoop`].
///
/// Clones share the same cell; [`Promise::same`] compares cell identity,
/// which the session cache uses to detect whether a pending slot still
/// belongs to a given in-flight read.
pub struct Promise<T> {
    ev: EventLoop,
    id: u64,
    label: Arc<str>,
    inner: Arc<Mutex<PromiseInner<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            ev: self.ev.clone(),
            id: self.id,
            label: self.label.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.inner.lock().state {
            State::Pending => "pending",
            State::Done(Ok(_)) => "done",
            State::Done(Err(_)) => "failed",
        };
        write!(f, "Promise({}, {state})", self.label)
    }
}

impl<T: Send + 'static> Promise<T> {
    /// Create a pending promise. The label records the creation site and is
    /// what deadlock reports print for this promise.
    pub fn new(ev: &EventLoop, label: impl Into<String>) -> Self {
        let label: Arc<str> = label.into().into();
        let inner = Arc::new(Mutex::new(PromiseInner {
            state: State::Pending,
            callbacks: Vec::new(),
            wakers: Vec::new(),
        }));
        let fail = {
            let ev = ev.clone();
            let inner = inner.clone();
            Box::new(move |err: Arc<anyhow::Error>| {
                Self::finish(&ev, &inner, Err(err));
            })
        };
        let id = ev.register_pending(PendingEntry {
            label: label.to_string(),
            fail,
        });
        Self {
            ev: ev.clone(),
            id,
            label,
            inner,
        }
    }

    pub fn resolved(ev: &EventLoop, value: T) -> Self {
        let fut = Self::new(ev, "resolved");
        fut.set_result(value);
        fut
    }

    pub fn rejected(ev: &EventLoop, err: anyhow::Error) -> Self {
        let fut = Self::new(ev, "rejected");
        fut.set_exception(err);
        fut
    }

    /// Transition the shared cell out of pending. Returns false if it was
    /// already done.
    fn finish(
        ev: &EventLoop,
        inner: &Arc<Mutex<PromiseInner<T>>>,
        result: Result<T, Arc<anyhow::Error>>,
    ) -> bool {
        let (callbacks, wakers) = {
            let mut state = inner.lock();
            if !matches!(state.state, State::Pending) {
                return false;
            }
            state.state = State::Done(result);
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.wakers),
            )
        };
        for cb in callbacks {
            ev.queue_call(None, cb);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Set the value. Legal only while pending.
    pub fn set_result(&self, value: T) {
        if Self::finish(&self.ev, &self.inner, Ok(value)) {
            self.ev.unregister_pending(self.id);
        } else {
            panic!("result set twice on {}", self.label);
        }
    }

    /// Set the failure. Legal only while pending.
    pub fn set_exception(&self, err: anyhow::Error) {
        tracing::debug!("{} failed: {err:#}", self.label);
        if Self::finish(&self.ev, &self.inner, Err(Arc::new(err))) {
            self.ev.unregister_pending(self.id);
        } else {
            panic!("result set twice on {}", self.label);
        }
    }

    /// Fail the promise if it is still pending; no-op otherwise. Batch
    /// fan-out uses this because a todo-tasklet may have satisfied some of
    /// its per-call promises before the batch itself failed.
    pub fn fail_if_pending(&self, err: Arc<anyhow::Error>) -> bool {
        let failed = Self::finish(&self.ev, &self.inner, Err(err));
        if failed {
            self.ev.unregister_pending(self.id);
        }
        failed
    }

    /// Resolve the promise if it is still pending; no-op otherwise. Used on
    /// completion paths that can lose a race with deadlock detection, which
    /// fails every pending promise out from under its owner.
    pub fn resolve_if_pending(&self, value: T) -> bool {
        let resolved = Self::finish(&self.ev, &self.inner, Ok(value));
        if resolved {
            self.ev.unregister_pending(self.id);
        }
        resolved
    }

    pub fn done(&self) -> bool {
        !matches!(self.inner.lock().state, State::Pending)
    }

    /// Register a completion callback. Callbacks fire exactly once, on the
    /// loop's immediate queue, in registration order; registering on a done
    /// promise schedules immediately.
    pub fn add_callback(&self, f: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Pending => {
                inner.callbacks.push(Box::new(f));
            },
            State::Done(_) => {
                drop(inner);
                self.ev.queue_call(None, f);
            },
        }
    }

    /// Drive the event loop until this promise is done. A drained loop with
    /// pending promises is a deadlock: every pending promise (this one
    /// included) is failed with a dump of the pending set.
    pub fn wait(&self) {
        while !self.done() {
            if !self.ev.run1() {
                let dump = self.ev.dump_pending();
                tracing::warn!(
                    "event loop drained while {} still pending; failing {} pending futures",
                    self.label,
                    self.ev.pending_count(),
                );
                let err = Arc::new(anyhow::Error::new(ClientError::Deadlock { dump }));
                self.ev.fail_all_pending(err);
            }
        }
    }

    /// Wait, then return the stored failure (if any).
    pub fn get_exception(&self) -> Option<Arc<anyhow::Error>> {
        self.wait();
        match &self.inner.lock().state {
            State::Done(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    pub(crate) fn event_loop(&self) -> &EventLoop {
        &self.ev
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// True iff `other` is a clone of this promise (same underlying cell).
    pub fn same(&self, other: &Promise<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// The stored outcome, without driving the loop.
    pub fn peek(&self) -> Option<Result<T, Arc<anyhow::Error>>> {
        match &self.inner.lock().state {
            State::Pending => None,
            State::Done(result) => Some(result.clone()),
        }
    }

    /// Wait, then return the value or re-raise the stored failure.
    pub fn get_result(&self) -> anyhow::Result<T> {
        self.wait();
        match &self.inner.lock().state {
            State::Done(Ok(value)) => Ok(value.clone()),
            State::Done(Err(err)) => Err(reshare(err)),
            State::Pending => unreachable!("wait returned with promise pending"),
        }
    }
}

impl<T: Clone + Send + 'static> Future for Promise<T> {
    type Output = anyhow::Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock();
        match &inner.state {
            State::Done(Ok(value)) => Poll::Ready(Ok(value.clone())),
            State::Done(Err(err)) => Poll::Ready(Err(reshare(err))),
            State::Pending => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            },
        }
    }
}

/// Drive the loop until one of `futures` completes; returns the first found
/// done. Returns `None` for an empty slice.
pub fn wait_any<T: Clone + Send + 'static>(futures: &[Promise<T>]) -> Option<Promise<T>> {
    let first = futures.first()?;
    let ev = first.event_loop().clone();
    loop {
        if let Some(done) = futures.iter().find(|f| f.done()) {
            return Some(done.clone());
        }
        if !ev.run1() {
            let dump = ev.dump_pending();
            let err = Arc::new(anyhow::Error::new(ClientError::Deadlock { dump }));
            ev.fail_all_pending(err);
        }
    }
}

/// Drive the loop until every one of `futures` is done.
pub fn wait_all<T: Clone + Send + 'static>(futures: &[Promise<T>]) {
    let Some(first) = futures.first() else {
        return;
    };
    let ev = first.event_loop().clone();
    while !futures.iter().all(|f| f.done()) {
        if !ev.run1() {
            let dump = ev.dump_pending();
            let err = Arc::new(anyhow::Error::new(ClientError::Deadlock { dump }));
            ev.fail_all_pending(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{
        wait_all,
        wait_any,
        Promise,
    };
    use crate::event_loop::EventLoop;

    #[test]
    fn test_get_result_returns_value() {
        let ev = EventLoop::new();
        let fut = Promise::new(&ev, "value");
        fut.set_result(7u32);
        assert_eq!(fut.get_result().unwrap(), 7);
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let ev = EventLoop::new();
        let fut: Promise<()> = Promise::new(&ev, "ordered");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            fut.add_callback(move || order.lock().push(i));
        }
        fut.set_result(());
        ev.run();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_callback_on_done_promise_fires() {
        let ev = EventLoop::new();
        let fut = Promise::resolved(&ev, 1u8);
        let fired = Arc::new(Mutex::new(false));
        {
            let fired = fired.clone();
            fut.add_callback(move || *fired.lock() = true);
        }
        ev.run();
        assert!(*fired.lock());
    }

    #[test]
    #[should_panic(expected = "result set twice")]
    fn test_double_set_panics() {
        let ev = EventLoop::new();
        let fut = Promise::new(&ev, "twice");
        fut.set_result(1u8);
        fut.set_result(2u8);
    }

    #[test]
    fn test_fail_if_pending_tolerates_done() {
        let ev = EventLoop::new();
        let fut = Promise::resolved(&ev, 1u8);
        assert!(!fut.fail_if_pending(Arc::new(anyhow::anyhow!("late"))));
        assert_eq!(fut.get_result().unwrap(), 1);
    }

    #[test]
    fn test_unresolved_promise_deadlocks_with_dump() {
        let ev = EventLoop::new();
        let fut: Promise<()> = Promise::new(&ev, "orphaned read");
        let err = fut.get_result().unwrap_err();
        assert!(errors::is_deadlock(&err));
        assert!(format!("{err:#}").contains("orphaned read"));
    }

    #[test]
    fn test_deadlock_fails_every_pending_promise() {
        let ev = EventLoop::new();
        let one: Promise<()> = Promise::new(&ev, "one");
        let two: Promise<()> = Promise::new(&ev, "two");
        let err = one.get_result().unwrap_err();
        assert!(errors::is_deadlock(&err));
        assert!(two.done());
        assert!(errors::is_deadlock(&two.get_result().unwrap_err()));
        assert_eq!(ev.pending_count(), 0);
    }

    #[test]
    fn test_await_from_tasklet() {
        let ev = EventLoop::new();
        let source: Promise<u32> = Promise::new(&ev, "source");
        let dependent = {
            let source = source.clone();
            ev.spawn("dependent", async move { Ok(source.await? + 1) })
        };
        source.set_result(41);
        assert_eq!(dependent.get_result().unwrap(), 42);
    }

    #[test]
    fn test_resumption_order_matches_await_order() {
        let ev = EventLoop::new();
        let source: Promise<()> = Promise::new(&ev, "source");
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for i in 0..3 {
            let source = source.clone();
            let order = order.clone();
            waiters.push(ev.spawn(format!("waiter-{i}"), async move {
                source.await?;
                order.lock().push(i);
                Ok(())
            }));
        }
        // Let each waiter reach its await point before resolving.
        while ev.run1() {}
        source.set_result(());
        wait_all(&waiters);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_wait_any_returns_first_done() {
        let ev = EventLoop::new();
        let slow: Promise<u8> = Promise::new(&ev, "slow");
        let fast: Promise<u8> = Promise::new(&ev, "fast");
        fast.set_result(1);
        let done = wait_any(&[slow.clone(), fast.clone()]).unwrap();
        assert!(done.same(&fast));
        slow.set_result(2);
    }

    #[test]
    fn test_exception_reshared_to_each_observer() {
        let ev = EventLoop::new();
        let fut: Promise<u8> = Promise::new(&ev, "failing");
        fut.set_exception(errors::ClientError::validation("bad key"));
        let first = fut.get_result().unwrap_err();
        let second = fut.get_result().unwrap_err();
        for err in [first, second] {
            assert!(matches!(
                err.downcast_ref::<errors::ClientError>(),
                Some(errors::ClientError::Validation(_))
            ));
        }
    }
}
