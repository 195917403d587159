//! Cooperative single-strand concurrency: an explicit event loop, promises,
//! and tasklets.
//!
//! A tasklet is an async body spawned onto the strand's [`EventLoop`]; the
//! caller holds a [`Promise`] for its result. Tasklets suspend only when
//! they await a promise or a registered remote call; plain calls never
//! suspend. Synchronous callers cross the boundary with
//! [`Promise::get_result`], which drives the loop until the promise is done
//! and converts a drained-but-pending loop into a deadlock failure rather
//! than a hang.
//!
//! ```ignore
//! let ev = EventLoop::new();
//! let fut = ev.spawn("sum", async move {
//!     let a = sleep_then(1).await?;
//!     let b = sleep_then(2).await?;
//!     Ok(a + b)
//! });
//! let sum = fut.get_result()?;
//! ```

mod ambient;
mod combinators;
mod event_loop;
mod promise;

pub use ambient::{
    current as ambient_context,
    set as set_ambient_context,
    swap as swap_ambient_context,
    AmbientContext,
};
pub use combinators::{
    join,
    MergeQueue,
    MultiPromise,
    QueuePromise,
    Reducer,
    ReducerOutput,
    ReducingPromise,
    SerialQueuePromise,
};
pub use event_loop::{
    sleep,
    EventLoop,
    IdleDisposition,
};
pub use promise::{
    wait_all,
    wait_any,
    Promise,
};

use std::future::Future;

/// Spawn a tasklet and block at the synchronous boundary for its result.
///
/// This is the entry point for code that is not itself running as a tasklet
/// (request handlers, tests): the loop runs inline until the result is
/// available.
pub fn spawn_sync<T, F>(ev: &EventLoop, label: impl Into<String>, fut: F) -> anyhow::Result<T>
where
    T: Clone + Send + 'static,
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    ev.spawn(label, fut).get_result()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{
        spawn_sync,
        EventLoop,
    };

    #[test]
    fn test_tasklet_result_round_trips() {
        let ev = EventLoop::new();
        assert_eq!(
            spawn_sync(&ev, "ret", async { Ok("value".to_string()) }).unwrap(),
            "value"
        );
    }

    #[test]
    fn test_tasklet_error_propagates() {
        let ev = EventLoop::new();
        let err = spawn_sync::<(), _>(&ev, "raise", async {
            anyhow::bail!("tasklet exploded")
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("tasklet exploded"));
    }

    #[test]
    fn test_nested_tasklets() {
        let ev = EventLoop::new();
        let ev2 = ev.clone();
        let result = spawn_sync(&ev, "outer", async move {
            let inner = ev2.spawn("inner", async { Ok(21u64) });
            Ok(inner.await? * 2)
        })
        .unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_concurrent_tasklets_interleave() {
        let ev = EventLoop::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut futures = Vec::new();
        for name in ["a", "b"] {
            let log = log.clone();
            let ev2 = ev.clone();
            futures.push(ev.spawn(name, async move {
                log.lock().push(format!("{name}:start"));
                super::sleep(&ev2, std::time::Duration::from_millis(5)).await?;
                log.lock().push(format!("{name}:end"));
                Ok(())
            }));
        }
        super::wait_all(&futures);
        let log = log.lock();
        // Both started before either finished.
        assert_eq!(log[0], "a:start");
        assert_eq!(log[1], "b:start");
    }
}
