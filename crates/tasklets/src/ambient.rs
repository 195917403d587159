//! The strand-local ambient context slot.
//!
//! The session layer stores its current context here so that code deep in a
//! tasklet can look it up without threading a handle through every call.
//! Each tasklet captures the slot at spawn time; the value is installed
//! around every poll and restored afterward, so a tasklet that swaps its own
//! context (a transaction body does) keeps that context across suspension
//! points without leaking it to other tasklets interleaved on the loop.

use std::{
    any::Any,
    cell::RefCell,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
};

use pin_project::pin_project;

pub type AmbientContext = Arc<dyn Any + Send + Sync>;

thread_local! {
    static AMBIENT: RefCell<Option<AmbientContext>> = const { RefCell::new(None) };
}

/// The slot's current value.
pub fn current() -> Option<AmbientContext> {
    AMBIENT.with(|slot| slot.borrow().clone())
}

/// Replace the slot.
pub fn set(value: Option<AmbientContext>) {
    AMBIENT.with(|slot| *slot.borrow_mut() = value);
}

/// Replace the slot, returning the previous value.
pub fn swap(value: Option<AmbientContext>) -> Option<AmbientContext> {
    AMBIENT.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), value))
}

/// Wraps a tasklet body so its bound context is installed for the duration
/// of every poll. After each poll the slot is read back, so context changes
/// made by the body itself stick to the body.
#[pin_project]
pub(crate) struct ScopeAmbient<F> {
    bound: Option<AmbientContext>,
    #[pin]
    inner: F,
}

impl<F> ScopeAmbient<F> {
    pub(crate) fn new(bound: Option<AmbientContext>, inner: F) -> Self {
        Self { bound, inner }
    }
}

impl<F: Future> Future for ScopeAmbient<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let saved = swap(this.bound.clone());
        let result = this.inner.poll(cx);
        *this.bound = swap(saved);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        current,
        set,
        swap,
    };
    use crate::event_loop::EventLoop;

    fn ambient_u32() -> Option<u32> {
        current().and_then(|v| v.downcast_ref::<u32>().copied())
    }

    #[test]
    fn test_tasklet_sees_context_bound_at_spawn() {
        let ev = EventLoop::new();
        set(Some(Arc::new(7u32)));
        let fut = ev.spawn("bound", async { Ok(ambient_u32()) });
        set(None);
        assert_eq!(fut.get_result().unwrap(), Some(7));
        assert_eq!(ambient_u32(), None);
    }

    #[test]
    fn test_context_change_sticks_to_tasklet() {
        let ev = EventLoop::new();
        set(None);
        let gate: crate::Promise<()> = crate::Promise::new(&ev, "gate");
        let fut = {
            let gate = gate.clone();
            ev.spawn("switcher", async move {
                set(Some(Arc::new(3u32)));
                gate.await?;
                Ok(ambient_u32())
            })
        };
        // Run until the tasklet parks on the gate; the outer slot must be
        // untouched while it is suspended.
        while ev.run1() {}
        assert_eq!(ambient_u32(), None);
        gate.set_result(());
        assert_eq!(fut.get_result().unwrap(), Some(3));
    }

    #[test]
    fn test_swap_returns_previous() {
        set(Some(Arc::new(1u32)));
        let prev = swap(Some(Arc::new(2u32)));
        assert_eq!(prev.unwrap().downcast_ref::<u32>(), Some(&1));
        assert_eq!(ambient_u32(), Some(2));
        set(None);
    }
}
