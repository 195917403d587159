//! Aggregating promises.
//!
//! All four types share the same construction protocol: dependents (or
//! plain values via `putq`) are added, then `complete()` seals the set.
//! They differ in how results come back out:
//!
//! - [`MultiPromise`]: one list, in the order dependents were added.
//! - [`QueuePromise`]: one at a time via `getq`, in completion order.
//! - [`SerialQueuePromise`]: one at a time via `getq`, in insertion order.
//! - [`ReducingPromise`]: folded through a reducer in batches.

use std::{
    collections::{
        HashSet,
        VecDeque,
    },
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
};

use errors::{
    reshare,
    ClientError,
};
use parking_lot::Mutex;

use crate::{
    event_loop::EventLoop,
    promise::Promise,
};

/// Destination for mapped query results: anything following the
/// putq/complete protocol. Query mapping writes into one of these when the
/// caller wants results delivered incrementally instead of as one list.
pub trait MergeQueue<T>: Send + Sync {
    fn add_dependent(&self, dep: &Promise<T>);
    fn putq(&self, value: T);
    fn complete(&self);
    fn set_exception(&self, err: anyhow::Error);
}

fn end_of_queue() -> anyhow::Error {
    anyhow::Error::new(ClientError::EndOfQueue)
}

/// Copy `from`'s outcome onto `to` once `from` is done.
fn transfer<T: Clone + Send + 'static>(from: &Promise<T>, to: &Promise<T>) {
    match from.peek().expect("transfer from a pending promise") {
        Ok(value) => {
            to.resolve_if_pending(value);
        },
        Err(err) => {
            to.fail_if_pending(err);
        },
    }
}

// ---------------------------------------------------------------------------
// MultiPromise

struct MultiState<T> {
    full: bool,
    outstanding: usize,
    seen: HashSet<u64>,
    results: Vec<Promise<T>>,
}

/// A promise whose value is the ordered list of its dependents' results.
///
/// The first dependent failure fails the aggregate; remaining dependents may
/// still complete but their results are dropped. Adding the same dependent
/// twice is legal and yields its result twice.
pub struct MultiPromise<T> {
    result: Promise<Vec<T>>,
    state: Arc<Mutex<MultiState<T>>>,
}

impl<T> Clone for MultiPromise<T> {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> MultiPromise<T> {
    pub fn new(ev: &EventLoop, label: impl Into<String>) -> Self {
        Self {
            result: Promise::new(ev, label),
            state: Arc::new(Mutex::new(MultiState {
                full: false,
                outstanding: 0,
                seen: HashSet::new(),
                results: Vec::new(),
            })),
        }
    }

    pub fn add_dependent(&self, dep: &Promise<T>) {
        let register = {
            let mut state = self.state.lock();
            assert!(!state.full, "add_dependent after complete");
            state.results.push(dep.clone());
            if state.seen.insert(dep.id()) {
                state.outstanding += 1;
                true
            } else {
                false
            }
        };
        if register {
            let state = self.state.clone();
            let result = self.result.clone();
            dep.add_callback(move || Self::dependent_done(&state, &result));
        }
    }

    pub fn putq(&self, value: T) {
        let dep = Promise::resolved(self.result.event_loop(), value);
        self.add_dependent(&dep);
    }

    /// Seal the set; the aggregate completes once every dependent has.
    pub fn complete(&self) {
        let finish = {
            let mut state = self.state.lock();
            assert!(!state.full, "complete called twice");
            state.full = true;
            state.outstanding == 0
        };
        if finish {
            Self::finish(&self.state, &self.result);
        }
    }

    /// Force an early failure; no further dependents may be added.
    pub fn set_exception(&self, err: anyhow::Error) {
        self.state.lock().full = true;
        self.result.set_exception(err);
    }

    fn dependent_done(state: &Arc<Mutex<MultiState<T>>>, result: &Promise<Vec<T>>) {
        let finish = {
            let mut state = state.lock();
            state.outstanding -= 1;
            state.full && state.outstanding == 0 && !result.done()
        };
        if finish {
            Self::finish(state, result);
        }
    }

    fn finish(state: &Arc<Mutex<MultiState<T>>>, result: &Promise<Vec<T>>) {
        let dependents = state.lock().results.clone();
        let mut values = Vec::with_capacity(dependents.len());
        for dep in dependents {
            match dep.peek().expect("finish with a pending dependent") {
                Ok(value) => values.push(value),
                Err(err) => {
                    result.fail_if_pending(err);
                    return;
                },
            }
        }
        result.resolve_if_pending(values);
    }

    pub fn done(&self) -> bool {
        self.result.done()
    }

    pub fn result(&self) -> &Promise<Vec<T>> {
        &self.result
    }

    pub fn get_result(&self) -> anyhow::Result<Vec<T>> {
        self.result.get_result()
    }
}

impl<T: Clone + Send + 'static> Future for MultiPromise<T> {
    type Output = anyhow::Result<Vec<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result).poll(cx)
    }
}

impl<T: Clone + Send + 'static> MergeQueue<T> for MultiPromise<T> {
    fn add_dependent(&self, dep: &Promise<T>) {
        MultiPromise::add_dependent(self, dep)
    }

    fn putq(&self, value: T) {
        MultiPromise::putq(self, value)
    }

    fn complete(&self) {
        MultiPromise::complete(self)
    }

    fn set_exception(&self, err: anyhow::Error) {
        MultiPromise::set_exception(self, err)
    }
}

/// Aggregate a slice of promises: the common "await them all, in order" case
/// built on [`MultiPromise`].
pub fn join<T: Clone + Send + 'static>(
    ev: &EventLoop,
    futures: &[Promise<T>],
) -> Promise<Vec<T>> {
    let multi = MultiPromise::new(ev, "join");
    for fut in futures {
        multi.add_dependent(fut);
    }
    multi.complete();
    multi.result().clone()
}

// ---------------------------------------------------------------------------
// QueuePromise

struct QueueState<T> {
    full: bool,
    outstanding: usize,
    seen: HashSet<u64>,
    completed: VecDeque<Result<T, Arc<anyhow::Error>>>,
    waiting: VecDeque<Promise<T>>,
}

/// Delivers dependent results one at a time, in completion order.
///
/// The aggregate promise resolves (with unit) when the last dependent is
/// done, whether or not the results were retrieved. A per-item failure is
/// delivered on the corresponding `getq` promise and does not terminate the
/// queue. Invariant: at least one of `completed` and `waiting` is empty.
pub struct QueuePromise<T> {
    ev: EventLoop,
    result: Promise<()>,
    state: Arc<Mutex<QueueState<T>>>,
}

impl<T> Clone for QueuePromise<T> {
    fn clone(&self) -> Self {
        Self {
            ev: self.ev.clone(),
            result: self.result.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> QueuePromise<T> {
    pub fn new(ev: &EventLoop, label: impl Into<String>) -> Self {
        Self {
            ev: ev.clone(),
            result: Promise::new(ev, label),
            state: Arc::new(Mutex::new(QueueState {
                full: false,
                outstanding: 0,
                seen: HashSet::new(),
                completed: VecDeque::new(),
                waiting: VecDeque::new(),
            })),
        }
    }

    pub fn add_dependent(&self, dep: &Promise<T>) {
        let register = {
            let mut state = self.state.lock();
            assert!(!state.full, "add_dependent after complete");
            if state.seen.insert(dep.id()) {
                state.outstanding += 1;
                true
            } else {
                false
            }
        };
        if register {
            let this = self.clone();
            let dep = dep.clone();
            let dep2 = dep.clone();
            dep.add_callback(move || this.dependent_done(&dep2));
        }
    }

    pub fn putq(&self, value: T) {
        let dep = Promise::resolved(&self.ev, value);
        self.add_dependent(&dep);
    }

    pub fn complete(&self) {
        let finish = {
            let mut state = self.state.lock();
            assert!(!state.full, "complete called twice");
            state.full = true;
            state.outstanding == 0
        };
        if finish {
            self.result.resolve_if_pending(());
            self.drain_waiting();
        }
    }

    pub fn set_exception(&self, err: anyhow::Error) {
        let finish = {
            let mut state = self.state.lock();
            state.full = true;
            state.outstanding == 0
        };
        self.result.set_exception(err);
        if finish {
            self.drain_waiting();
        }
    }

    fn eof_error(&self) -> anyhow::Error {
        match self.result.peek() {
            Some(Err(err)) => reshare(&err),
            _ => end_of_queue(),
        }
    }

    /// A promise for the next result, in completion order. After the queue
    /// is sealed and drained, the returned promise fails with `EndOfQueue`
    /// (or the exception the queue was failed with).
    pub fn getq(&self) -> Promise<T> {
        let mut state = self.state.lock();
        if let Some(outcome) = state.completed.pop_front() {
            drop(state);
            return self.outcome_promise(outcome);
        }
        if state.full && state.outstanding == 0 {
            drop(state);
            return self.eof_promise();
        }
        let fut = Promise::new(&self.ev, "queue.getq");
        state.waiting.push_back(fut.clone());
        fut
    }

    pub fn done(&self) -> bool {
        self.result.done()
    }

    pub fn result(&self) -> &Promise<()> {
        &self.result
    }

    fn dependent_done(&self, dep: &Promise<T>) {
        let outcome = dep.peek().expect("dependent not done");
        let (waiter, finish) = {
            let mut state = self.state.lock();
            state.outstanding -= 1;
            let waiter = state.waiting.pop_front();
            if waiter.is_none() {
                state.completed.push_back(outcome.clone());
            }
            (waiter, state.full && state.outstanding == 0)
        };
        if let Some(waiter) = waiter {
            match outcome {
                Ok(value) => {
                    waiter.resolve_if_pending(value);
                },
                Err(err) => {
                    waiter.fail_if_pending(err);
                },
            }
        }
        if finish {
            self.result.resolve_if_pending(());
            self.drain_waiting();
        }
    }

    /// Waiters left after the queue finished get the end-of-queue failure.
    fn drain_waiting(&self) {
        let waiters: Vec<Promise<T>> = {
            let mut state = self.state.lock();
            state.waiting.drain(..).collect()
        };
        for waiter in waiters {
            waiter.fail_if_pending(Arc::new(self.eof_error()));
        }
    }

    fn outcome_promise(&self, outcome: Result<T, Arc<anyhow::Error>>) -> Promise<T> {
        match outcome {
            Ok(value) => Promise::resolved(&self.ev, value),
            Err(err) => Promise::rejected(&self.ev, reshare(&err)),
        }
    }

    fn eof_promise(&self) -> Promise<T> {
        Promise::rejected(&self.ev, self.eof_error())
    }
}

impl<T: Clone + Send + 'static> MergeQueue<T> for QueuePromise<T> {
    fn add_dependent(&self, dep: &Promise<T>) {
        QueuePromise::add_dependent(self, dep)
    }

    fn putq(&self, value: T) {
        QueuePromise::putq(self, value)
    }

    fn complete(&self) {
        QueuePromise::complete(self)
    }

    fn set_exception(&self, err: anyhow::Error) {
        QueuePromise::set_exception(self, err)
    }
}

// ---------------------------------------------------------------------------
// SerialQueuePromise

struct SerialState<T> {
    full: bool,
    queue: VecDeque<Promise<T>>,
    waiting: VecDeque<Promise<T>>,
}

/// Like [`QueuePromise`] but delivery order is insertion order.
///
/// Invariant: at least one of `queue` and `waiting` is empty, and every
/// promise in `waiting` is pending.
pub struct SerialQueuePromise<T> {
    ev: EventLoop,
    result: Promise<()>,
    state: Arc<Mutex<SerialState<T>>>,
}

impl<T> Clone for SerialQueuePromise<T> {
    fn clone(&self) -> Self {
        Self {
            ev: self.ev.clone(),
            result: self.result.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> SerialQueuePromise<T> {
    pub fn new(ev: &EventLoop, label: impl Into<String>) -> Self {
        Self {
            ev: ev.clone(),
            result: Promise::new(ev, label),
            state: Arc::new(Mutex::new(SerialState {
                full: false,
                queue: VecDeque::new(),
                waiting: VecDeque::new(),
            })),
        }
    }

    /// Push a plain value. An outstanding waiter receives it directly.
    pub fn putq(&self, value: T) {
        let waiter = {
            let mut state = self.state.lock();
            assert!(!state.full, "putq after complete");
            state.waiting.pop_front()
        };
        match waiter {
            Some(waiter) => {
                waiter.resolve_if_pending(value);
            },
            None => {
                let fut = Promise::resolved(&self.ev, value);
                self.state.lock().queue.push_back(fut);
            },
        }
    }

    pub fn add_dependent(&self, dep: &Promise<T>) {
        let waiter = {
            let mut state = self.state.lock();
            assert!(!state.full, "add_dependent after complete");
            state.waiting.pop_front()
        };
        match waiter {
            Some(waiter) => {
                let dep2 = dep.clone();
                dep.add_callback(move || transfer(&dep2, &waiter));
            },
            None => self.state.lock().queue.push_back(dep.clone()),
        }
    }

    pub fn complete(&self) {
        let (waiters, finish) = {
            let mut state = self.state.lock();
            assert!(!state.full, "complete called twice");
            state.full = true;
            let waiters: Vec<Promise<T>> = state.waiting.drain(..).collect();
            (waiters, state.queue.is_empty())
        };
        for waiter in waiters {
            waiter.fail_if_pending(Arc::new(end_of_queue()));
        }
        if finish {
            self.result.resolve_if_pending(());
        }
    }

    pub fn set_exception(&self, err: anyhow::Error) {
        let waiters: Vec<Promise<T>> = {
            let mut state = self.state.lock();
            state.full = true;
            state.waiting.drain(..).collect()
        };
        let shared = Arc::new(err);
        self.result.set_exception(reshare(&shared));
        for waiter in waiters {
            waiter.fail_if_pending(shared.clone());
        }
    }

    /// A promise for the next result, in insertion order. `getq` itself
    /// never blocks; the returned promise fails with `EndOfQueue` once the
    /// sealed queue is drained.
    pub fn getq(&self) -> Promise<T> {
        let mut state = self.state.lock();
        if let Some(fut) = state.queue.pop_front() {
            let finish = state.queue.is_empty() && state.full && !self.result.done();
            drop(state);
            if finish {
                self.result.resolve_if_pending(());
            }
            return fut;
        }
        if state.full {
            drop(state);
            let err = match self.result.peek() {
                Some(Err(err)) => reshare(&err),
                _ => end_of_queue(),
            };
            return Promise::rejected(&self.ev, err);
        }
        let fut = Promise::new(&self.ev, "serial_queue.getq");
        state.waiting.push_back(fut.clone());
        fut
    }

    pub fn done(&self) -> bool {
        self.result.done()
    }

    pub fn result(&self) -> &Promise<()> {
        &self.result
    }
}

impl<T: Clone + Send + 'static> MergeQueue<T> for SerialQueuePromise<T> {
    fn add_dependent(&self, dep: &Promise<T>) {
        SerialQueuePromise::add_dependent(self, dep)
    }

    fn putq(&self, value: T) {
        SerialQueuePromise::putq(self, value)
    }

    fn complete(&self) {
        SerialQueuePromise::complete(self)
    }

    fn set_exception(&self, err: anyhow::Error) {
        SerialQueuePromise::set_exception(self, err)
    }
}

// ---------------------------------------------------------------------------
// ReducingPromise

/// Output of one reducer application: either a value or more deferred work
/// that re-enters the buffer when it completes.
pub enum ReducerOutput<T> {
    Value(T),
    Deferred(Promise<T>),
}

pub type Reducer<T> = Box<dyn FnMut(Vec<T>) -> ReducerOutput<T> + Send>;

struct ReducingState<T> {
    full: bool,
    outstanding: usize,
    seen: HashSet<u64>,
    buffer: VecDeque<T>,
    reducer: Option<Reducer<T>>,
    batch_size: usize,
}

/// Folds dependent results through a reducer in batches of `batch_size`.
///
/// The reducer's input may be reordered relative to insertion. The final
/// value is none-equivalent for zero results and the single buffered value
/// for one; otherwise the reducer output for the remainder.
pub struct ReducingPromise<T> {
    ev: EventLoop,
    result: Promise<Option<T>>,
    state: Arc<Mutex<ReducingState<T>>>,
}

impl<T> Clone for ReducingPromise<T> {
    fn clone(&self) -> Self {
        Self {
            ev: self.ev.clone(),
            result: self.result.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> ReducingPromise<T> {
    pub fn new(
        ev: &EventLoop,
        label: impl Into<String>,
        reducer: Reducer<T>,
        batch_size: usize,
    ) -> Self {
        assert!(batch_size > 0, "batch_size must be positive");
        Self {
            ev: ev.clone(),
            result: Promise::new(ev, label),
            state: Arc::new(Mutex::new(ReducingState {
                full: false,
                outstanding: 0,
                seen: HashSet::new(),
                buffer: VecDeque::new(),
                reducer: Some(reducer),
                batch_size,
            })),
        }
    }

    pub fn add_dependent(&self, dep: &Promise<T>) {
        assert!(!self.state.lock().full, "add_dependent after complete");
        self.internal_add_dependent(dep);
    }

    pub fn putq(&self, value: T) {
        let dep = Promise::resolved(&self.ev, value);
        self.add_dependent(&dep);
    }

    pub fn complete(&self) {
        let finish = {
            let mut state = self.state.lock();
            assert!(!state.full, "complete called twice");
            state.full = true;
            state.outstanding == 0
        };
        if finish {
            self.mark_finished();
        }
    }

    pub fn set_exception(&self, err: anyhow::Error) {
        {
            let mut state = self.state.lock();
            state.full = true;
            state.buffer.clear();
        }
        self.result.set_exception(err);
    }

    pub fn done(&self) -> bool {
        self.result.done()
    }

    pub fn result(&self) -> &Promise<Option<T>> {
        &self.result
    }

    pub fn get_result(&self) -> anyhow::Result<Option<T>> {
        self.result.get_result()
    }

    /// Adding reducer outputs is legal even after the set is sealed.
    fn internal_add_dependent(&self, dep: &Promise<T>) {
        let register = {
            let mut state = self.state.lock();
            if state.seen.insert(dep.id()) {
                state.outstanding += 1;
                true
            } else {
                false
            }
        };
        if register {
            let this = self.clone();
            let dep = dep.clone();
            let dep2 = dep.clone();
            dep.add_callback(move || this.dependent_done(&dep2));
        }
    }

    fn dependent_done(&self, dep: &Promise<T>) {
        {
            let mut state = self.state.lock();
            state.outstanding -= 1;
        }
        if self.result.done() {
            return;
        }
        match dep.peek().expect("dependent not done") {
            Ok(value) => {
                let batch = {
                    let mut state = self.state.lock();
                    state.buffer.push_back(value);
                    if state.buffer.len() >= state.batch_size {
                        Some(state.buffer.drain(..).collect::<Vec<_>>())
                    } else {
                        None
                    }
                };
                if let Some(batch) = batch {
                    match self.reduce(batch) {
                        ReducerOutput::Value(value) => self.state.lock().buffer.push_back(value),
                        ReducerOutput::Deferred(dep) => self.internal_add_dependent(&dep),
                    }
                }
            },
            Err(err) => {
                self.state.lock().buffer.clear();
                self.result.fail_if_pending(err);
                return;
            },
        }
        let finish = {
            let state = self.state.lock();
            state.full && state.outstanding == 0
        };
        if finish && !self.result.done() {
            self.mark_finished();
        }
    }

    fn mark_finished(&self) {
        let remainder = {
            let mut state = self.state.lock();
            state.buffer.drain(..).collect::<Vec<_>>()
        };
        match remainder.len() {
            0 => {
                self.result.resolve_if_pending(None);
            },
            1 => {
                self.result
                    .resolve_if_pending(Some(remainder.into_iter().next().unwrap()));
            },
            _ => match self.reduce(remainder) {
                ReducerOutput::Value(value) => {
                    self.result.resolve_if_pending(Some(value));
                },
                ReducerOutput::Deferred(dep) => self.internal_add_dependent(&dep),
            },
        }
    }

    /// The reducer runs outside the state lock; it is user code and may add
    /// more work to this promise.
    fn reduce(&self, batch: Vec<T>) -> ReducerOutput<T> {
        let mut reducer = self
            .state
            .lock()
            .reducer
            .take()
            .expect("reducer re-entered");
        let output = reducer(batch);
        self.state.lock().reducer = Some(reducer);
        output
    }
}

impl<T: Clone + Send + 'static> MergeQueue<T> for ReducingPromise<T> {
    fn add_dependent(&self, dep: &Promise<T>) {
        ReducingPromise::add_dependent(self, dep)
    }

    fn putq(&self, value: T) {
        ReducingPromise::putq(self, value)
    }

    fn complete(&self) {
        ReducingPromise::complete(self)
    }

    fn set_exception(&self, err: anyhow::Error) {
        ReducingPromise::set_exception(self, err)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        join,
        MultiPromise,
        QueuePromise,
        ReducerOutput,
        ReducingPromise,
        SerialQueuePromise,
    };
    use crate::{
        event_loop::EventLoop,
        promise::Promise,
    };

    #[test]
    fn test_multi_results_in_addition_order() {
        let ev = EventLoop::new();
        let multi = MultiPromise::new(&ev, "multi");
        let first: Promise<u32> = Promise::new(&ev, "first");
        let second: Promise<u32> = Promise::new(&ev, "second");
        multi.add_dependent(&first);
        multi.add_dependent(&second);
        multi.putq(3);
        multi.complete();
        // Complete out of order; results still come back in addition order.
        second.set_result(2);
        first.set_result(1);
        assert_eq!(multi.get_result().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_multi_duplicate_dependent_counts_twice() {
        let ev = EventLoop::new();
        let multi = MultiPromise::new(&ev, "multi");
        let dep: Promise<u32> = Promise::new(&ev, "dep");
        multi.add_dependent(&dep);
        multi.add_dependent(&dep);
        multi.complete();
        dep.set_result(5);
        assert_eq!(multi.get_result().unwrap(), vec![5, 5]);
    }

    #[test]
    fn test_multi_first_failure_wins() {
        let ev = EventLoop::new();
        let multi = MultiPromise::new(&ev, "multi");
        let ok: Promise<u32> = Promise::new(&ev, "ok");
        let bad: Promise<u32> = Promise::new(&ev, "bad");
        multi.add_dependent(&ok);
        multi.add_dependent(&bad);
        multi.complete();
        bad.set_exception(anyhow::anyhow!("boom"));
        ok.set_result(1);
        let err = multi.get_result().unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
    }

    #[test]
    fn test_join_collects_in_order() {
        let ev = EventLoop::new();
        let futures: Vec<Promise<u32>> = (0..3)
            .map(|i| Promise::new(&ev, format!("f{i}")))
            .collect();
        let all = join(&ev, &futures);
        for (i, fut) in futures.iter().enumerate().rev() {
            fut.set_result(i as u32);
        }
        assert_eq!(all.get_result().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_queue_delivery_in_completion_order() {
        let ev = EventLoop::new();
        let queue = QueuePromise::new(&ev, "queue");
        let slow: Promise<u32> = Promise::new(&ev, "slow");
        let fast: Promise<u32> = Promise::new(&ev, "fast");
        queue.add_dependent(&slow);
        queue.add_dependent(&fast);
        queue.complete();
        fast.set_result(2);
        slow.set_result(1);
        assert_eq!(queue.getq().get_result().unwrap(), 2);
        assert_eq!(queue.getq().get_result().unwrap(), 1);
        let err = queue.getq().get_result().unwrap_err();
        assert!(errors::is_end_of_queue(&err));
    }

    #[test]
    fn test_queue_putq_then_eof() {
        let ev = EventLoop::new();
        let queue = QueuePromise::new(&ev, "queue");
        queue.putq(9u32);
        queue.complete();
        assert_eq!(queue.getq().get_result().unwrap(), 9);
        let err = queue.getq().get_result().unwrap_err();
        assert!(errors::is_end_of_queue(&err));
        assert!(queue.done());
    }

    #[test]
    fn test_queue_item_failure_does_not_terminate() {
        let ev = EventLoop::new();
        let queue = QueuePromise::new(&ev, "queue");
        let bad: Promise<u32> = Promise::new(&ev, "bad");
        queue.add_dependent(&bad);
        queue.putq(4);
        queue.complete();
        bad.set_exception(anyhow::anyhow!("item failed"));
        let err = queue.getq().get_result().unwrap_err();
        assert!(format!("{err:#}").contains("item failed"));
        assert_eq!(queue.getq().get_result().unwrap(), 4);
    }

    #[test]
    fn test_queue_waiter_receives_result_then_eof() {
        let ev = EventLoop::new();
        let queue: QueuePromise<u32> = QueuePromise::new(&ev, "queue");
        let waiter = queue.getq();
        let starved = queue.getq();
        queue.putq(1);
        assert_eq!(waiter.get_result().unwrap(), 1);
        queue.complete();
        let err = starved.get_result().unwrap_err();
        assert!(errors::is_end_of_queue(&err));
    }

    #[test]
    fn test_serial_queue_insertion_order() {
        let ev = EventLoop::new();
        let queue = SerialQueuePromise::new(&ev, "serial");
        let slow: Promise<u32> = Promise::new(&ev, "slow");
        queue.add_dependent(&slow);
        queue.putq(2);
        queue.complete();
        slow.set_result(1);
        // Insertion order even though the plain value was ready first.
        assert_eq!(queue.getq().get_result().unwrap(), 1);
        assert_eq!(queue.getq().get_result().unwrap(), 2);
        let err = queue.getq().get_result().unwrap_err();
        assert!(errors::is_end_of_queue(&err));
    }

    #[test]
    fn test_serial_queue_waiter_handoff() {
        let ev = EventLoop::new();
        let queue: SerialQueuePromise<u32> = SerialQueuePromise::new(&ev, "serial");
        let waiter = queue.getq();
        queue.putq(7);
        assert_eq!(waiter.get_result().unwrap(), 7);
    }

    #[test]
    fn test_serial_queue_complete_fails_outstanding_waiters() {
        let ev = EventLoop::new();
        let queue: SerialQueuePromise<u32> = SerialQueuePromise::new(&ev, "serial");
        let waiter = queue.getq();
        queue.complete();
        let err = waiter.get_result().unwrap_err();
        assert!(errors::is_end_of_queue(&err));
        assert!(queue.done());
    }

    #[test]
    fn test_reducing_sums_in_batches() {
        let ev = EventLoop::new();
        let reducing = ReducingPromise::new(
            &ev,
            "sum",
            Box::new(|batch: Vec<u64>| ReducerOutput::Value(batch.into_iter().sum())),
            3,
        );
        for i in 1..=7u64 {
            reducing.putq(i);
        }
        reducing.complete();
        ev.run();
        assert_eq!(reducing.get_result().unwrap(), Some(28));
    }

    #[test]
    fn test_reducing_empty_and_single() {
        let ev = EventLoop::new();
        let empty: ReducingPromise<u64> = ReducingPromise::new(
            &ev,
            "empty",
            Box::new(|batch: Vec<u64>| ReducerOutput::Value(batch.into_iter().sum())),
            2,
        );
        empty.complete();
        assert_eq!(empty.get_result().unwrap(), None);

        let single = ReducingPromise::new(
            &ev,
            "single",
            Box::new(|batch: Vec<u64>| ReducerOutput::Value(batch.into_iter().sum())),
            2,
        );
        single.putq(5);
        single.complete();
        ev.run();
        assert_eq!(single.get_result().unwrap(), Some(5));
    }

    #[test]
    fn test_reducing_deferred_output() {
        let ev = EventLoop::new();
        let ev2 = ev.clone();
        let reducing = ReducingPromise::new(
            &ev,
            "deferred",
            Box::new(move |batch: Vec<u64>| {
                ReducerOutput::Deferred(Promise::resolved(&ev2, batch.into_iter().sum()))
            }),
            2,
        );
        for i in [1u64, 2, 3, 4] {
            reducing.putq(i);
        }
        reducing.complete();
        ev.run();
        assert_eq!(reducing.get_result().unwrap(), Some(10));
    }
}
