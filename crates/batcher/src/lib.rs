//! Coalesces concurrent single-item calls that share options into batched
//! work.
//!
//! Each [`AutoBatcher`] is built around one todo-tasklet: the routine that
//! takes an accumulated list of `(promise, arg)` pairs plus the shared
//! options and issues a single multi-key remote call, satisfying each
//! per-call promise from the batch response. The batcher itself only decides
//! when to hand a bucket over: immediately once a bucket reaches `limit`,
//! otherwise from an event-loop idler, so that a caller blocking on one
//! result flushes everyone's pending work.

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    hash::Hash,
    sync::Arc,
};

use parking_lot::Mutex;
use tasklets::{
    join,
    EventLoop,
    IdleDisposition,
    Promise,
};

/// The accumulated bucket handed to a todo-tasklet: per-call promises paired
/// with their arguments, in insertion order.
pub type TodoList<A, R> = Vec<(Promise<R>, A)>;

/// The batched routine. Contract: on success it has set a result on every
/// promise in the list; on failure it may leave promises pending and the
/// batcher fans the batch error out to them.
pub type TodoTasklet<A, R, O> = Arc<dyn Fn(TodoList<A, R>, O) -> Promise<()> + Send + Sync>;

struct Inner<A, R, O> {
    /// One bucket per distinct options value.
    queues: HashMap<O, TodoList<A, R>>,
    /// Bucket flush order. Entries may be stale (bucket already flushed by
    /// hitting the limit); `action` skips those.
    order: VecDeque<O>,
    /// In-flight batch promises.
    running: Vec<Promise<()>>,
    /// Dedup cache for `add_once`, evicted on completion.
    cache: HashMap<(A, O), Promise<R>>,
}

pub struct AutoBatcher<A, R, O> {
    ev: EventLoop,
    name: &'static str,
    todo_tasklet: TodoTasklet<A, R, O>,
    limit: usize,
    inner: Arc<Mutex<Inner<A, R, O>>>,
}

impl<A, R, O> Clone for AutoBatcher<A, R, O> {
    fn clone(&self) -> Self {
        Self {
            ev: self.ev.clone(),
            name: self.name,
            todo_tasklet: self.todo_tasklet.clone(),
            limit: self.limit,
            inner: self.inner.clone(),
        }
    }
}

impl<A, R, O> AutoBatcher<A, R, O>
where
    A: Clone + Send + 'static,
    R: Clone + Send + 'static,
    O: Clone + Eq + Hash + Send + 'static,
{
    /// `limit` is the bucket size that forces an immediate flush.
    pub fn new(
        ev: &EventLoop,
        name: &'static str,
        limit: usize,
        todo_tasklet: TodoTasklet<A, R, O>,
    ) -> Self {
        assert!(limit > 0, "batch limit must be positive");
        Self {
            ev: ev.clone(),
            name,
            todo_tasklet,
            limit,
            inner: Arc::new(Mutex::new(Inner {
                queues: HashMap::new(),
                order: VecDeque::new(),
                running: Vec::new(),
                cache: HashMap::new(),
            })),
        }
    }

    /// Queue one argument, returning the promise for its individual result.
    /// Reaching `limit` flushes the bucket before returning.
    pub fn add(&self, arg: A, options: O) -> Promise<R> {
        let fut = Promise::new(&self.ev, format!("{}.add", self.name));
        let (install_idler, full_bucket) = {
            let mut inner = self.inner.lock();
            let install_idler = inner.queues.is_empty();
            if !inner.queues.contains_key(&options) {
                inner.order.push_back(options.clone());
                inner.queues.insert(options.clone(), Vec::new());
            }
            let queue = inner
                .queues
                .get_mut(&options)
                .expect("bucket inserted above");
            queue.push((fut.clone(), arg));
            let full_bucket = if queue.len() >= self.limit {
                inner.queues.remove(&options).map(|todo| (options, todo))
            } else {
                None
            };
            (install_idler, full_bucket)
        };
        if install_idler {
            let this = self.clone();
            self.ev.add_idle(move || this.on_idle());
        }
        if let Some((options, todo)) = full_bucket {
            self.run_queue(options, todo);
        }
        fut
    }

    /// Like [`AutoBatcher::add`] but concurrent calls with the same
    /// `(arg, options)` share one promise. The dedup entry is evicted when
    /// the shared promise completes.
    pub fn add_once(&self, arg: A, options: O) -> Promise<R>
    where
        A: Eq + Hash,
    {
        let key = (arg.clone(), options.clone());
        if let Some(fut) = self.inner.lock().cache.get(&key) {
            return fut.clone();
        }
        let fut = self.add(arg, options);
        self.inner.lock().cache.insert(key.clone(), fut.clone());
        let inner = self.inner.clone();
        fut.add_callback(move || {
            inner.lock().cache.remove(&key);
        });
        fut
    }

    /// Flush one bucket if any is queued. Buckets flush in creation order.
    pub fn action(&self) -> bool {
        let next = {
            let mut inner = self.inner.lock();
            loop {
                match inner.order.pop_front() {
                    None => break None,
                    Some(options) => {
                        if let Some(todo) = inner.queues.remove(&options) {
                            break Some((options, todo));
                        }
                        // Stale entry; the bucket already flushed at limit.
                    },
                }
            }
        };
        match next {
            Some((options, todo)) => {
                self.run_queue(options, todo);
                true
            },
            None => false,
        }
    }

    fn on_idle(&self) -> IdleDisposition {
        if self.action() {
            IdleDisposition::Keep
        } else {
            IdleDisposition::Done
        }
    }

    fn run_queue(&self, options: O, todo: TodoList<A, R>) {
        tracing::debug!("{}: flushing {} items", self.name, todo.len());
        let batch_fut = (self.todo_tasklet)(todo.clone(), options);
        self.inner.lock().running.push(batch_fut.clone());
        let this = self.clone();
        let batch = batch_fut.clone();
        batch_fut.add_callback(move || this.finished_batch(&batch, &todo));
    }

    /// On batch success the todo-tasklet has satisfied every per-call
    /// promise already; on failure the batch error goes to each promise
    /// still pending.
    fn finished_batch(&self, batch_fut: &Promise<()>, todo: &TodoList<A, R>) {
        {
            let mut inner = self.inner.lock();
            inner.running.retain(|fut| !fut.same(batch_fut));
        }
        if let Some(Err(err)) = batch_fut.peek() {
            tracing::warn!("{} batch failed: {err:#}", self.name);
            for (fut, _) in todo {
                fut.fail_if_pending(err.clone());
            }
        }
    }

    /// A tasklet that drains this batcher: flushes queued buckets and waits
    /// out in-flight batches until both are empty.
    pub fn flush(&self) -> Promise<()> {
        let this = self.clone();
        self.ev.spawn(format!("{}.flush", self.name), async move {
            loop {
                let running = this.inner.lock().running.clone();
                if !running.is_empty() {
                    join(&this.ev, &running).await?;
                    continue;
                }
                if !this.action() {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Queued (unflushed) item count across all buckets.
    pub fn queued_len(&self) -> usize {
        self.inner.lock().queues.values().map(Vec::len).sum()
    }

    /// Number of entries in the `add_once` dedup cache.
    pub fn dedup_len(&self) -> usize {
        self.inner.lock().cache.len()
    }
}
