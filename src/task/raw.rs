use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, ThreadId};

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use kv_log_macro::{error, trace};
use pin_project_lite::pin_project;

use crate::error::{Error, Result};
use crate::event_loop::Handle;
use crate::task::TaskId;
use crate::utils::panic_message;

/// Type-erased view of a task frame, as stored in a loop's task registry and
/// in wakers. Everything here may only be called on the task's affine thread.
pub(crate) trait Pollable: 'static {
    /// Polls the frame until it yields or completes.
    fn resume_by_ref(&self);

    fn is_done(&self) -> bool;

    /// Marks the task started, returning the previous value.
    fn mark_started(&self) -> bool;

    /// Registers a completion observer; runs it immediately if already done.
    fn add_observer(&self, observer: Box<dyn FnOnce()>);
}

pin_project! {
    /// Wraps the task body so a panic becomes a stored [`Error::Panicked`]
    /// instead of unwinding into the loop.
    struct CatchUnwind<F> {
        #[pin]
        future: F,
    }
}

impl<F, T> Future for CatchUnwind<F>
where
    F: Future<Output = Result<T>>,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let future = self.project().future;
        match panic::catch_unwind(AssertUnwindSafe(|| future.poll(cx))) {
            Ok(poll) => poll,
            Err(payload) => Poll::Ready(Err(Error::Panicked(panic_message(payload)))),
        }
    }
}

/// The saved locals of one task activation.
struct Frame<T> {
    /// The task body; `None` once completed.
    future: Option<LocalBoxFuture<'static, Result<T>>>,
    /// The completed value or error, until consumed by `get()`/await.
    result: Option<Result<T>>,
    /// Single-shot completion callbacks.
    observers: Vec<Box<dyn FnOnce()>>,
    /// Guards against re-entrant polls from same-thread wakes.
    running: bool,
    /// Set when a wake arrived while the frame was being polled.
    repoll: bool,
}

/// State shared between a task handle, its waker, and its loop's registry.
///
/// The frame itself is only ever touched on `thread`; the atomics and the
/// parent slot may be read from anywhere.
pub(crate) struct TaskCore<T: 'static> {
    id: TaskId,
    thread: ThreadId,
    /// The affine loop's handle; `None` for instant tasks.
    route: Option<Handle>,
    waker: Waker,
    started: AtomicBool,
    done: AtomicBool,
    /// The continuation awaiting this task, at most one.
    parent: Mutex<Option<Waker>>,
    frame: RefCell<Frame<T>>,
}

// Safety: `frame` is confined to the creating thread; every access asserts
// this. The remaining fields are thread-safe.
unsafe impl<T> Send for TaskCore<T> {}
unsafe impl<T> Sync for TaskCore<T> {}

impl<T: 'static> TaskCore<T> {
    pub(crate) fn new<F>(future: F, route: Option<Handle>) -> Arc<TaskCore<T>>
    where
        F: Future<Output = Result<T>> + 'static,
    {
        let id = TaskId::generate();
        let thread = thread::current().id();
        let core = Arc::new_cyclic(|weak: &Weak<TaskCore<T>>| {
            let target: Weak<dyn Pollable + Send + Sync> = weak.clone();
            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                thread,
                route: route.clone(),
                target,
            }));
            TaskCore {
                id,
                thread,
                route,
                waker,
                started: AtomicBool::new(false),
                done: AtomicBool::new(false),
                parent: Mutex::new(None),
                frame: RefCell::new(Frame {
                    future: Some(CatchUnwind { future }.boxed_local()),
                    result: None,
                    observers: Vec::new(),
                    running: false,
                    repoll: false,
                }),
            }
        });
        trace!("task created", { task_id: id.as_u64() });
        core
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn thread(&self) -> ThreadId {
        self.thread
    }

    pub(crate) fn route(&self) -> Option<&Handle> {
        self.route.as_ref()
    }

    fn assert_affine(&self) {
        assert_eq!(
            thread::current().id(),
            self.thread,
            "task frame touched from a foreign thread"
        );
    }

    /// Marks the task started, returning the previous value.
    pub(crate) fn mark_started(&self) -> bool {
        self.started.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Records the awaiting continuation. A task may have at most one parent;
    /// a second, different one is a programming error.
    pub(crate) fn register_parent(&self, waker: &Waker) {
        let mut parent = self.parent.lock().unwrap();
        match &*parent {
            Some(existing) if existing.will_wake(waker) => {}
            Some(_) => panic!("task already has a parent awaiting it"),
            None => *parent = Some(waker.clone()),
        }
    }

    pub(crate) fn clear_parent(&self) {
        self.parent.lock().unwrap().take();
    }

    /// Takes the completed result out of the frame.
    ///
    /// Panics if the task is not done, or if the result was already consumed
    /// by an earlier `get()`/await.
    pub(crate) fn take_result(&self) -> Result<T> {
        self.assert_affine();
        assert!(self.is_done(), "task is not complete");
        self.frame
            .borrow_mut()
            .result
            .take()
            .expect("task result already consumed")
    }

    pub(crate) fn peek_result<R>(&self, f: impl FnOnce(&Result<T>) -> R) -> Option<R> {
        self.assert_affine();
        self.frame.borrow().result.as_ref().map(f)
    }

    fn finish(&self, result: Result<T>) {
        let observers = {
            let mut frame = self.frame.borrow_mut();
            frame.result = Some(result);
            frame.running = false;
            frame.repoll = false;
            std::mem::take(&mut frame.observers)
        };
        self.done.store(true, Ordering::Release);
        trace!("task completed", { task_id: self.id.as_u64() });
        for observer in observers {
            observer();
        }
        // Take the waker out before waking: in edition 2021 the `if let`
        // scrutinee's MutexGuard would otherwise stay locked across the wake,
        // deadlocking when the woken awaiter touches the parent slot inline.
        let parent = self.parent.lock().unwrap().take();
        if let Some(parent) = parent {
            parent.wake();
        }
    }
}

impl<T: 'static> Pollable for TaskCore<T> {
    fn resume_by_ref(&self) {
        self.assert_affine();
        if self.is_done() {
            return;
        }
        {
            let mut frame = self.frame.borrow_mut();
            if frame.running {
                frame.repoll = true;
                return;
            }
            frame.running = true;
        }
        loop {
            let mut future = match self.frame.borrow_mut().future.take() {
                Some(future) => future,
                None => return,
            };
            let mut cx = Context::from_waker(&self.waker);
            match future.as_mut().poll(&mut cx) {
                Poll::Pending => {
                    let mut frame = self.frame.borrow_mut();
                    frame.future = Some(future);
                    if frame.repoll {
                        frame.repoll = false;
                        drop(frame);
                        continue;
                    }
                    frame.running = false;
                    return;
                }
                Poll::Ready(result) => {
                    self.finish(result);
                    return;
                }
            }
        }
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn mark_started(&self) -> bool {
        self.started.swap(true, Ordering::AcqRel)
    }

    fn add_observer(&self, observer: Box<dyn FnOnce()>) {
        self.assert_affine();
        if self.is_done() {
            observer();
            return;
        }
        self.frame.borrow_mut().observers.push(observer);
    }
}

/// A waker that routes a wake to the task's affine thread.
///
/// Same-thread wakes resume the frame inline (so a resolved future runs its
/// awaiter before anything else); cross-thread wakes post a resume message to
/// the affine loop. Either way the target is held weakly: once the owning
/// handle has been dropped, the wake quietly evaporates.
struct TaskWaker {
    id: TaskId,
    thread: ThreadId,
    route: Option<Handle>,
    target: Weak<dyn Pollable + Send + Sync>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if thread::current().id() == self.thread {
            if let Some(core) = self.target.upgrade() {
                core.resume_by_ref();
            }
        } else if let Some(route) = &self.route {
            route.resume(self.id);
        } else {
            error!("instant task woken from a foreign thread; wake dropped", {
                task_id: self.id.as_u64(),
            });
        }
    }
}
