use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::thread;

use kv_log_macro::debug;

use crate::error::Result;
use crate::event_loop::{self, Loop};
use crate::task::raw::{Pollable, TaskCore};
use crate::task::TaskId;
use crate::utils::AssertSend;

/// Spawns a loop-affine task on the current thread's [`Loop`].
///
/// The task does not run until it is [started](Task::start), awaited, or
/// driven by [`Loop::run_task`]. It is affine to the loop of the spawning
/// thread: the handle may be moved to (and started from) other threads, but
/// the body only ever runs on that loop.
///
/// # Panics
///
/// Panics if no loop exists on the current thread.
///
/// # Examples
///
/// ```
/// use strand::{task, Loop};
///
/// let lp = Loop::new();
/// let t = task::spawn(async { Ok("hello") });
/// assert_eq!(lp.run_task(t).unwrap(), "hello");
/// ```
pub fn spawn<F, T>(future: F) -> Task<T>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    event_loop::with_current(|lp| spawn_on(lp, future))
        .expect("no event loop running on this thread")
}

/// Spawns a loop-affine task on a specific [`Loop`].
///
/// Must be called on the loop's own thread.
pub fn spawn_on<F, T>(lp: &Loop, future: F) -> Task<T>
where
    F: Future<Output = Result<T>> + 'static,
    T: 'static,
{
    let core = TaskCore::new(future, Some(lp.handle()));
    let weak: Weak<dyn Pollable + Send + Sync> = Arc::<TaskCore<T>>::downgrade(&core);
    lp.register_task(core.id(), weak);
    Task { core: Some(core) }
}

/// A handle that exclusively owns one loop-affine task.
///
/// Dropping the handle destroys the task outright, wherever it got to; a
/// resumption already scheduled for a destroyed task is suppressed by the
/// registry's weak reference. See [`Task::detach`] for fire-and-forget use.
pub struct Task<T: 'static> {
    core: Option<Arc<TaskCore<T>>>,
}

impl<T: 'static> Task<T> {
    fn core(&self) -> &Arc<TaskCore<T>> {
        self.core.as_ref().expect("task handle already consumed")
    }

    pub fn id(&self) -> TaskId {
        self.core().id()
    }

    /// Starts the task if it has not started yet, returning whether it is now
    /// complete.
    ///
    /// On the affine thread the task runs inline until its first suspension;
    /// from any other thread a resume is posted to the affine loop and this
    /// returns `false`.
    pub fn start(&self) -> bool {
        let core = self.core();
        if core.mark_started() {
            return core.is_done();
        }
        if thread::current().id() == core.thread() {
            core.resume_by_ref();
        } else {
            let route = core.route().expect("loop task without a route");
            route.resume(core.id());
        }
        core.is_done()
    }

    /// Whether the task has ever been resumed.
    pub fn started(&self) -> bool {
        self.core().is_started()
    }

    /// Whether the task has run to completion.
    pub fn done(&self) -> bool {
        self.core().is_done()
    }

    /// Consumes the handle and returns the task's result.
    ///
    /// # Panics
    ///
    /// Panics if the task is not done, or if the result was already taken by
    /// an earlier await.
    pub fn get(mut self) -> Result<T> {
        let core = self.core.take().expect("task handle already consumed");
        let result = core.take_result();
        release(&core);
        result
    }

    /// Registers a single-shot completion callback.
    ///
    /// Runs immediately if the task is already done.
    pub fn on_completed(&self, observer: impl FnOnce() + 'static) {
        self.core().add_observer(Box::new(observer));
    }

    /// Relinquishes the task to its loop: the frame keeps running to
    /// completion in the background and its result is discarded.
    pub fn detach(mut self) {
        let core = self.core.take().expect("task handle already consumed");
        core.clear_parent();
        if core.is_done() {
            release(&core);
            return;
        }
        let id = core.id();
        let pollable: Arc<dyn Pollable + Send + Sync> = core.clone();
        if thread::current().id() == core.thread() {
            let kept = event_loop::with_current(|lp| lp.keep_detached(id, pollable));
            if kept.is_none() {
                debug!("detached task dropped: no loop on this thread", {
                    task_id: id.as_u64(),
                });
            }
        } else if let Some(route) = core.route() {
            route.keep(id, pollable);
        }
    }

    pub(crate) fn peek<R>(&self, f: impl FnOnce(&Result<T>) -> R) -> Option<R> {
        self.core().peek_result(f)
    }

    pub(crate) fn set_parent(&self, waker: &Waker) {
        self.core().register_parent(waker);
    }

    pub(crate) fn clear_parent(&self) {
        self.core().clear_parent();
    }
}

/// Drops the last handle-owned reference on the affine thread, unregistering
/// the task and logging any error nobody looked at.
fn release<T: 'static>(core: &Arc<TaskCore<T>>) {
    core.peek_result(|result| {
        if let Err(err) = result {
            debug!("task dropped with unobserved error", {
                task_id: core.id().as_u64(),
                error: err.to_string(),
            });
        }
    });
    if let Some(route) = core.route() {
        let id = core.id();
        let route = route.clone();
        let _ = event_loop::with_current(|lp| {
            if lp.handle().same_loop(&route) {
                lp.forget_task(id);
            }
        });
    }
}

impl<T: 'static> Drop for Task<T> {
    fn drop(&mut self) {
        let core = match self.core.take() {
            Some(core) => core,
            None => return,
        };
        if thread::current().id() == core.thread() {
            release(&core);
        } else if let Some(route) = core.route() {
            // The frame must be torn down on its affine thread; ship the last
            // strong reference back over the injector queue.
            let route = route.clone();
            let id = core.id();
            let parcel = AssertSend(core);
            route.run_remote(Box::new(move || {
                let core = parcel.0;
                let _ = event_loop::with_current(|lp| lp.forget_task(id));
                drop(core);
            }));
        }
    }
}

impl<T: 'static> Future for Task<T> {
    type Output = Result<T>;

    /// Awaiting a task makes the awaiter its parent continuation. A complete
    /// task returns its result without suspending; a task already started
    /// elsewhere suspends without re-starting it; anything else is started
    /// inline.
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

impl<T: 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Task");
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
