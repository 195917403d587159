//! The cooperative scheduler that drives tasklets, timers, and transport
//! completions on a single execution strand.
//!
//! One [`EventLoop`] exists per strand; everything that happens in this
//! workspace happens during one of its ticks. A tick ([`EventLoop::run1`])
//! makes exactly one unit of progress, in priority order: one immediate
//! callback or tasklet poll, then promotion of due timers, then one idler,
//! and finally transport progress (blocking the thread, bounded by the
//! earliest timer, when there is nothing else to do). When a tick finds all
//! four empty the loop reports that it is drained, which is what deadlock
//! detection in [`Promise::wait`](crate::Promise::wait) keys off.

use std::{
    cell::RefCell,
    collections::{
        BTreeMap,
        BTreeSet,
        HashMap,
        VecDeque,
    },
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        Weak,
    },
    task::{
        Context,
        Wake,
        Waker,
    },
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::{
    Condvar,
    Mutex,
};

use crate::{
    ambient,
    promise::Promise,
};

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;
type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// What an idler asks the loop to do with it after a turn.
pub enum IdleDisposition {
    /// Leave the idler installed; it has more work to hand out.
    Keep,
    /// Remove the idler.
    Done,
}

enum Unit {
    Call(Callback),
    PollTask(u64),
}

struct TaskEntry {
    fut: Option<TaskFuture>,
    queued: bool,
}

struct RpcEntry {
    fut: Option<TaskFuture>,
}

pub(crate) struct PendingEntry {
    pub label: String,
    pub fail: Box<dyn FnMut(Arc<anyhow::Error>) + Send>,
}

struct Inner {
    ready: VecDeque<Unit>,
    timers: BTreeMap<(Instant, u64), Callback>,
    idlers: VecDeque<Box<dyn FnMut() -> IdleDisposition + Send>>,
    tasks: HashMap<u64, TaskEntry>,
    rpcs: HashMap<u64, RpcEntry>,
    woken_rpcs: BTreeSet<u64>,
    pending: BTreeMap<u64, PendingEntry>,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Parked-thread wakeup, shared by every waker the loop hands out.
struct LoopNotify {
    cv: Condvar,
    unparked: Mutex<bool>,
}

impl LoopNotify {
    fn notify(&self) {
        let mut unparked = self.unparked.lock();
        *unparked = true;
        self.cv.notify_all();
    }

    /// Park until notified or `deadline`, consuming the notification flag.
    fn wait(&self, deadline: Option<Instant>) {
        let mut unparked = self.unparked.lock();
        loop {
            if *unparked {
                *unparked = false;
                return;
            }
            match deadline {
                Some(deadline) => {
                    if self.cv.wait_until(&mut unparked, deadline).timed_out() {
                        *unparked = false;
                        return;
                    }
                },
                None => self.cv.wait(&mut unparked),
            }
        }
    }
}

struct TaskWaker {
    id: u64,
    inner: Weak<Mutex<Inner>>,
    notify: Arc<LoopNotify>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(inner) = self.inner.upgrade() {
            let mut inner = inner.lock();
            let should_queue = match inner.tasks.get_mut(&self.id) {
                Some(task) if !task.queued => {
                    task.queued = true;
                    true
                },
                _ => false,
            };
            if should_queue {
                inner.ready.push_back(Unit::PollTask(self.id));
            }
        }
        self.notify.notify();
    }
}

struct RpcWaker {
    id: u64,
    inner: Weak<Mutex<Inner>>,
    notify: Arc<LoopNotify>,
}

impl Wake for RpcWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().woken_rpcs.insert(self.id);
        }
        self.notify.notify();
    }
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<LoopNotify>,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                ready: VecDeque::new(),
                timers: BTreeMap::new(),
                idlers: VecDeque::new(),
                tasks: HashMap::new(),
                rpcs: HashMap::new(),
                woken_rpcs: BTreeSet::new(),
                pending: BTreeMap::new(),
                next_id: 0,
            })),
            notify: Arc::new(LoopNotify {
                cv: Condvar::new(),
                unparked: Mutex::new(false),
            }),
        }
    }

    /// The strand's event loop, created on first use. Each OS thread is its
    /// own strand; handles must not be shared across strands.
    pub fn current() -> EventLoop {
        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            match &*current {
                Some(ev) => ev.clone(),
                None => {
                    let ev = EventLoop::new();
                    *current = Some(ev.clone());
                    ev
                },
            }
        })
    }

    /// Replace the strand's loop. Tests use this to start from a clean loop.
    pub fn install(ev: &EventLoop) {
        CURRENT_LOOP.with(|current| *current.borrow_mut() = Some(ev.clone()));
    }

    /// Schedule `f` to run after `delay` (immediately for `None` or zero).
    /// Immediate callbacks run in FIFO order; delayed callbacks with the
    /// same due time run in insertion order.
    pub fn queue_call(&self, delay: Option<Duration>, f: impl FnOnce() + Send + 'static) {
        {
            let mut inner = self.inner.lock();
            match delay {
                None => inner.ready.push_back(Unit::Call(Box::new(f))),
                Some(delay) if delay.is_zero() => inner.ready.push_back(Unit::Call(Box::new(f))),
                Some(delay) => {
                    let seq = inner.next_id();
                    inner
                        .timers
                        .insert((Instant::now() + delay, seq), Box::new(f));
                },
            }
        }
        self.notify.notify();
    }

    /// Install an idler, run only when the immediate queue is drained. The
    /// loop keeps invoking installed idlers round-robin until each returns
    /// [`IdleDisposition::Done`].
    pub fn add_idle(&self, f: impl FnMut() -> IdleDisposition + Send + 'static) {
        self.inner.lock().idlers.push_back(Box::new(f));
    }

    /// Spawn a tasklet. The body is scheduled on the immediate queue and
    /// runs under the ambient session context that was current at spawn
    /// time; the returned promise resolves with the body's result.
    pub fn spawn<T, F>(&self, label: impl Into<String>, fut: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let promise = Promise::new(self, label);
        let done = promise.clone();
        let task = ambient::ScopeAmbient::new(ambient::current(), async move {
            // Tolerant completion: the promise may already have been failed
            // by deadlock detection while this tasklet was suspended.
            match fut.await {
                Ok(value) => {
                    done.resolve_if_pending(value);
                },
                Err(err) => {
                    done.fail_if_pending(Arc::new(err));
                },
            }
        });
        {
            let mut inner = self.inner.lock();
            let id = inner.next_id();
            inner.tasks.insert(
                id,
                TaskEntry {
                    fut: Some(Box::pin(task)),
                    queued: true,
                },
            );
            inner.ready.push_back(Unit::PollTask(id));
        }
        self.notify.notify();
        promise
    }

    /// Register an in-flight remote call. The loop only blocks for transport
    /// progress on calls registered here, so every transport future must go
    /// through this method rather than being awaited directly; a directly
    /// awaited transport future is invisible to the drain check and reports
    /// a spurious deadlock. Transport errors without a
    /// [`errors::ClientError`] classification are wrapped as `Rpc`.
    pub fn queue_rpc<T, F>(&self, label: impl Into<String>, rpc: F) -> Promise<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let promise = Promise::new(self, label);
        let done = promise.clone();
        let fut = async move {
            match rpc.await {
                Ok(value) => {
                    done.resolve_if_pending(value);
                },
                Err(err) => {
                    let err = if err.downcast_ref::<errors::ClientError>().is_some() {
                        err
                    } else {
                        errors::ClientError::rpc(&err)
                    };
                    done.fail_if_pending(Arc::new(err));
                },
            }
        };
        {
            let mut inner = self.inner.lock();
            let id = inner.next_id();
            inner.rpcs.insert(
                id,
                RpcEntry {
                    fut: Some(Box::pin(fut)),
                },
            );
            inner.woken_rpcs.insert(id);
        }
        self.notify.notify();
        promise
    }

    /// Make one unit of progress. Returns false iff the loop is drained:
    /// nothing immediate, no timers, no idlers, no in-flight remote calls.
    pub fn run1(&self) -> bool {
        // Immediate queue.
        let unit = self.inner.lock().ready.pop_front();
        if let Some(unit) = unit {
            match unit {
                Unit::Call(cb) => cb(),
                Unit::PollTask(id) => self.poll_task(id),
            }
            return true;
        }

        // Promote timers that have come due, preserving insertion order
        // within a due-time bucket.
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let mut promoted = false;
            while let Some((&(due, seq), _)) = inner.timers.iter().next() {
                if due > now {
                    break;
                }
                let cb = inner
                    .timers
                    .remove(&(due, seq))
                    .expect("timer entry disappeared");
                inner.ready.push_back(Unit::Call(cb));
                promoted = true;
            }
            if promoted {
                return true;
            }
        }

        // Idlers flush batchers while the loop is otherwise quiet.
        let idler = self.inner.lock().idlers.pop_front();
        if let Some(mut idler) = idler {
            if matches!(idler(), IdleDisposition::Keep) {
                self.inner.lock().idlers.push_back(idler);
            }
            return true;
        }

        // Transport progress, bounded by the earliest timer.
        let (woken, has_rpcs, next_due) = {
            let mut inner = self.inner.lock();
            let woken: Vec<u64> = std::mem::take(&mut inner.woken_rpcs).into_iter().collect();
            let has_rpcs = !inner.rpcs.is_empty();
            let next_due = inner.timers.keys().next().map(|&(due, _)| due);
            (woken, has_rpcs, next_due)
        };
        if !woken.is_empty() {
            for id in woken {
                self.poll_rpc(id);
            }
            return true;
        }
        if has_rpcs {
            self.notify.wait(next_due);
            return true;
        }
        if let Some(due) = next_due {
            // Nothing runnable until the first timer fires.
            self.notify.wait(Some(due));
            return true;
        }
        false
    }

    /// Run until the loop is drained.
    pub fn run(&self) {
        while self.run1() {}
    }

    fn poll_task(&self, id: u64) {
        let fut = {
            let mut inner = self.inner.lock();
            match inner.tasks.get_mut(&id) {
                Some(task) => {
                    task.queued = false;
                    task.fut.take()
                },
                None => None,
            }
        };
        let Some(mut fut) = fut else {
            return;
        };
        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            inner: Arc::downgrade(&self.inner),
            notify: self.notify.clone(),
        }));
        let mut cx = Context::from_waker(&waker);
        if fut.as_mut().poll(&mut cx).is_ready() {
            self.inner.lock().tasks.remove(&id);
        } else {
            let mut inner = self.inner.lock();
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.fut = Some(fut);
            }
        }
    }

    fn poll_rpc(&self, id: u64) {
        let fut = {
            let mut inner = self.inner.lock();
            inner.rpcs.get_mut(&id).and_then(|rpc| rpc.fut.take())
        };
        let Some(mut fut) = fut else {
            return;
        };
        let waker = Waker::from(Arc::new(RpcWaker {
            id,
            inner: Arc::downgrade(&self.inner),
            notify: self.notify.clone(),
        }));
        let mut cx = Context::from_waker(&waker);
        if fut.as_mut().poll(&mut cx).is_ready() {
            self.inner.lock().rpcs.remove(&id);
        } else {
            let mut inner = self.inner.lock();
            if let Some(rpc) = inner.rpcs.get_mut(&id) {
                rpc.fut = Some(fut);
            }
        }
    }

    pub(crate) fn register_pending(&self, entry: PendingEntry) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id();
        inner.pending.insert(id, entry);
        id
    }

    pub(crate) fn unregister_pending(&self, id: u64) {
        self.inner.lock().pending.remove(&id);
    }

    /// One line per pending promise, oldest first. Included in deadlock
    /// failures so the report names each stuck future's creation site.
    pub fn dump_pending(&self) -> String {
        let inner = self.inner.lock();
        inner
            .pending
            .values()
            .map(|entry| format!("- {}", entry.label))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Number of promises still pending on this loop.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Fail every pending promise with `err`. Invoked when the loop drains
    /// with futures outstanding; the failures schedule their callbacks, so
    /// stuck tasklets observe the error on subsequent ticks.
    pub fn fail_all_pending(&self, err: Arc<anyhow::Error>) {
        let entries: Vec<PendingEntry> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.pending).into_values().collect()
        };
        for mut entry in entries {
            (entry.fail)(err.clone());
        }
    }
}

/// A promise that resolves after `duration`, via the loop's timer queue.
pub fn sleep(ev: &EventLoop, duration: Duration) -> Promise<()> {
    let fut = Promise::new(ev, format!("sleep({duration:?})"));
    let done = fut.clone();
    ev.queue_call(Some(duration), move || done.set_result(()));
    fut
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{
                AtomicUsize,
                Ordering,
            },
            Arc,
        },
        time::{
            Duration,
            Instant,
        },
    };

    use parking_lot::Mutex;

    use super::{
        sleep,
        EventLoop,
        IdleDisposition,
    };

    #[test]
    fn test_immediate_callbacks_run_fifo() {
        let ev = EventLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = order.clone();
            ev.queue_call(None, move || order.lock().push(i));
        }
        ev.run();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_timers_fire_in_due_order() {
        let ev = EventLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (i, ms) in [(0u32, 30u64), (1, 10), (2, 20)] {
            let order = order.clone();
            ev.queue_call(Some(Duration::from_millis(ms)), move || {
                order.lock().push(i)
            });
        }
        ev.run();
        assert_eq!(*order.lock(), vec![1, 2, 0]);
    }

    #[test]
    fn test_idler_runs_after_immediate_queue_drains() {
        let ev = EventLoop::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = order.clone();
            ev.add_idle(move || {
                order.lock().push("idle");
                IdleDisposition::Done
            });
        }
        {
            let order = order.clone();
            ev.queue_call(None, move || order.lock().push("call"));
        }
        ev.run();
        assert_eq!(*order.lock(), vec!["call", "idle"]);
    }

    #[test]
    fn test_idler_kept_until_done() {
        let ev = EventLoop::new();
        let remaining = Arc::new(AtomicUsize::new(3));
        {
            let remaining = remaining.clone();
            ev.add_idle(move || {
                if remaining.fetch_sub(1, Ordering::SeqCst) > 1 {
                    IdleDisposition::Keep
                } else {
                    IdleDisposition::Done
                }
            });
        }
        ev.run();
        assert_eq!(remaining.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_run1_reports_drained_loop() {
        let ev = EventLoop::new();
        assert!(!ev.run1());
        ev.queue_call(None, || {});
        assert!(ev.run1());
        assert!(!ev.run1());
    }

    #[test]
    fn test_sleep_resolves_no_earlier_than_requested() {
        let ev = EventLoop::new();
        let start = Instant::now();
        let fut = sleep(&ev, Duration::from_millis(50));
        fut.get_result().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        // Generous upper bound; the loop should wake promptly.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_spawned_tasklet_runs_on_next_tick() {
        let ev = EventLoop::new();
        let fut = ev.spawn("answer", async { Ok(42u64) });
        assert!(!fut.done());
        ev.run();
        assert!(fut.done());
        assert_eq!(fut.get_result().unwrap(), 42);
    }

    #[test]
    fn test_queue_rpc_completes_ready_transport_future() {
        let ev = EventLoop::new();
        let fut = ev.queue_rpc("rpc.echo", async { Ok("pong".to_string()) });
        assert_eq!(fut.get_result().unwrap(), "pong");
    }

    #[test]
    fn test_rpc_error_classified_as_rpc() {
        let ev = EventLoop::new();
        let fut: crate::Promise<()> =
            ev.queue_rpc("rpc.boom", async { Err(anyhow::anyhow!("socket closed")) });
        let err = fut.get_result().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<errors::ClientError>(),
            Some(errors::ClientError::Rpc(_))
        ));
    }
}
