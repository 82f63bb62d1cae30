use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

use crate::error::Result;
use crate::task::raw::{Pollable, TaskCore};
use crate::task::TaskId;

/// A lightweight task pinned to its creating thread.
///
/// Unlike [`Task`](crate::task::Task), an `InstantTask` is not registered
/// with any loop and cannot be started or resumed from another thread. It
/// suits short coroutines spliced into an already-running one, where the
/// loop round trip of a full task is pure overhead.
pub struct InstantTask<T: 'static> {
    core: Option<Arc<TaskCore<T>>>,
    _not_send: PhantomData<*const ()>,
}

impl<T: 'static> InstantTask<T> {
    /// Wraps a future without scheduling it. The task runs only when started
    /// or awaited, always inline on this thread.
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + 'static,
    {
        InstantTask {
            core: Some(TaskCore::new(future, None)),
            _not_send: PhantomData,
        }
    }

    fn core(&self) -> &Arc<TaskCore<T>> {
        self.core.as_ref().expect("task handle already consumed")
    }

    pub fn id(&self) -> TaskId {
        self.core().id()
    }

    /// Runs the task inline until its first suspension, returning whether it
    /// completed.
    pub fn start(&self) -> bool {
        let core = self.core();
        assert_eq!(
            thread::current().id(),
            core.thread(),
            "instant task started off its owning thread"
        );
        if !core.mark_started() {
            core.resume_by_ref();
        }
        core.is_done()
    }

    pub fn started(&self) -> bool {
        self.core().is_started()
    }

    pub fn done(&self) -> bool {
        self.core().is_done()
    }

    /// Consumes the handle and returns the task's result.
    ///
    /// # Panics
    ///
    /// Panics if the task is not done.
    pub fn get(mut self) -> Result<T> {
        let core = self.core.take().expect("task handle already consumed");
        core.take_result()
    }

    /// Registers a single-shot completion callback; runs immediately if the
    /// task is already done.
    pub fn on_completed(&self, observer: impl FnOnce() + 'static) {
        self.core().add_observer(Box::new(observer));
    }
}

impl<T: 'static> Future for InstantTask<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let core = self.core();
        if core.is_done() {
            core.clear_parent();
            return Poll::Ready(core.take_result());
        }
        core.register_parent(cx.waker());
        if !core.mark_started() {
            core.resume_by_ref();
            if core.is_done() {
                core.clear_parent();
                return Poll::Ready(core.take_result());
            }
        }
        Poll::Pending
    }
}

impl<T: 'static> fmt::Debug for InstantTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("InstantTask");
        match &self.core {
            Some(core) => s
                .field("id", &core.id())
                .field("started", &core.is_started())
                .field("done", &core.is_done())
                .finish(),
            None => s.field("consumed", &true).finish(),
        }
    }
}
