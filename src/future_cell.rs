//! A resolvable one-value cell shared between a producer and one awaiter.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};

struct State<V> {
    value: Option<Result<V>>,
    waker: Option<Waker>,
}

/// A cell a coroutine can await until some other party resolves it.
///
/// Resolving may happen before or after the awaiter suspends; an awaiter of
/// an already-resolved cell never suspends at all. The cell is reusable
/// through [`reset`](FutureCell::reset), but holds at most one value and one
/// awaiter at a time.
///
/// Clones share the same underlying cell.
pub struct FutureCell<V> {
    inner: Arc<Mutex<State<V>>>,
}

impl<V> FutureCell<V> {
    pub fn new() -> FutureCell<V> {
        FutureCell {
            inner: Arc::new(Mutex::new(State {
                value: None,
                waker: None,
            })),
        }
    }

    /// Stores a value and wakes the awaiter, if any.
    ///
    /// # Panics
    ///
    /// Panics if the cell already holds an unconsumed value.
    pub fn resolve(&self, value: V) {
        self.complete(Ok(value));
    }

    /// Stores an error and wakes the awaiter, if any.
    ///
    /// # Panics
    ///
    /// Panics if the cell already holds an unconsumed value.
    pub fn fail(&self, error: Error) {
        self.complete(Err(error));
    }

    fn complete(&self, value: Result<V>) {
        let waker = {
            let mut state = self.inner.lock().unwrap();
            assert!(state.value.is_none(), "future cell resolved twice");
            state.value = Some(value);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Whether the cell holds an unconsumed value.
    pub fn is_resolved(&self) -> bool {
        self.inner.lock().unwrap().value.is_some()
    }

    /// Discards any stored value so the cell can be resolved again.
    pub fn reset(&self) {
        self.inner.lock().unwrap().value = None;
    }

    /// Awaits the cell's value, consuming it.
    pub fn wait(&self) -> Wait<'_, V> {
        Wait { cell: self }
    }
}

impl<V> Clone for FutureCell<V> {
    fn clone(&self) -> FutureCell<V> {
        FutureCell {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Default for FutureCell<V> {
    fn default() -> FutureCell<V> {
        FutureCell::new()
    }
}

impl<V> fmt::Debug for FutureCell<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureCell")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Future returned by [`FutureCell::wait`].
pub struct Wait<'a, V> {
    cell: &'a FutureCell<V>,
}

impl<V> Future for Wait<'_, V> {
    type Output = Result<V>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.cell.inner.lock().unwrap();
        match state.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}
