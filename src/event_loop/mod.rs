//! The event loop that drives tasks, timers, and sockets.
//!
//! Each [`Loop`] is owned by exactly one thread and never migrates. Other
//! threads interact with it through its cheap, cloneable [`Handle`], which
//! pushes messages onto an injector queue and interrupts the poller. All
//! task frames, timers, and session state stay on the owning thread; the
//! handle is the only cross-thread surface.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak as ArcWeak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use kv_log_macro::{debug, trace};
use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::session::{Listener, Session, SessionFactory, SessionId};
use crate::task::{Pollable, Task, TaskId};

pub(crate) use reactor::{IoHandler, Reactor};

mod reactor;

thread_local! {
    static CURRENT: RefCell<Option<Rc<Inner>>> = RefCell::new(None);
}

/// The first loop created in the process, reachable from any thread.
static MAIN: Lazy<Mutex<Option<Handle>>> = Lazy::new(|| Mutex::new(None));

/// Runs `f` against the current thread's loop, if one exists.
pub(crate) fn with_current<R>(f: impl FnOnce(&Loop) -> R) -> Option<R> {
    CURRENT.with(|current| {
        current.borrow().as_ref().map(|inner| {
            f(&Loop {
                inner: inner.clone(),
            })
        })
    })
}

/// Work posted to a loop from another thread.
pub(crate) enum Message {
    /// Resume the task with this id, if it is still alive.
    Resume(TaskId),
    /// Run an action on the loop thread after a delay.
    Run {
        delay: Duration,
        action: Box<dyn FnOnce() + Send>,
    },
    /// Adopt a detached task so it runs to completion in the background.
    Keep {
        id: TaskId,
        core: Arc<dyn Pollable + Send + Sync>,
    },
}

/// State shared between a loop and its handles.
pub(crate) struct Shared {
    queue: Mutex<Vec<Message>>,
    waker: mio::Waker,
    shutdown: AtomicBool,
}

/// A thread-safe reference to a [`Loop`].
///
/// Handles never run loop work themselves; they enqueue it and wake the
/// owning thread.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// The handle of the first loop created in this process, if any.
    pub fn main() -> Option<Handle> {
        MAIN.lock().unwrap().clone()
    }

    /// Schedules `action` to run on the loop thread after `delay`.
    ///
    /// A zero delay runs it on the next loop iteration.
    pub fn defer(&self, delay: Duration, action: impl FnOnce() + Send + 'static) {
        self.send(Message::Run {
            delay,
            action: Box::new(action),
        });
    }

    /// Asks the loop to stop after its current iteration. Pending deferred
    /// actions and timers are abandoned.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Whether `other` refers to the same loop instance.
    pub fn same_loop(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn resume(&self, id: TaskId) {
        self.send(Message::Resume(id));
    }

    pub(crate) fn keep(&self, id: TaskId, core: Arc<dyn Pollable + Send + Sync>) {
        self.send(Message::Keep { id, core });
    }

    pub(crate) fn run_remote(&self, action: Box<dyn FnOnce() + Send>) {
        self.send(Message::Run {
            delay: Duration::ZERO,
            action,
        });
    }

    fn send(&self, message: Message) {
        self.shared.queue.lock().unwrap().push(message);
        let _ = self.shared.waker.wake();
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

pub(crate) struct Inner {
    thread: ThreadId,
    shared: Arc<Shared>,
    reactor: Reactor,
    timers: RefCell<BTreeMap<(Instant, u64), Box<dyn FnOnce()>>>,
    timer_seq: Cell<u64>,
    tasks: RefCell<HashMap<TaskId, ArcWeak<dyn Pollable + Send + Sync>>>,
    detached: RefCell<HashMap<TaskId, Arc<dyn Pollable + Send + Sync>>>,
    sessions: RefCell<BTreeMap<SessionId, Rc<Session>>>,
    listeners: RefCell<Vec<Rc<Listener>>>,
    next_session: Cell<SessionId>,
}

/// A single-threaded event loop.
///
/// The loop runs tasks cooperatively: each resumption runs until the task
/// suspends or completes, and nothing else happens on the thread meanwhile.
/// Create one per thread that needs to drive I/O or tasks.
///
/// Dropping the `Loop` releases its sessions and listeners but the thread's
/// current-loop designation persists; creating a second loop on the same
/// thread after the first is dropped is not supported.
pub struct Loop {
    inner: Rc<Inner>,
}

impl Loop {
    /// Creates a loop bound to the calling thread.
    ///
    /// The first loop of the thread becomes the thread's current loop, and
    /// the first loop of the process becomes [`Handle::main`].
    ///
    /// # Panics
    ///
    /// Panics if the OS poller cannot be created.
    pub fn new() -> Loop {
        let (reactor, waker) = Reactor::new().expect("cannot create I/O reactor");
        let inner = Rc::new(Inner {
            thread: thread::current().id(),
            shared: Arc::new(Shared {
                queue: Mutex::new(Vec::new()),
                waker,
                shutdown: AtomicBool::new(false),
            }),
            reactor,
            timers: RefCell::new(BTreeMap::new()),
            timer_seq: Cell::new(0),
            tasks: RefCell::new(HashMap::new()),
            detached: RefCell::new(HashMap::new()),
            sessions: RefCell::new(BTreeMap::new()),
            listeners: RefCell::new(Vec::new()),
            next_session: Cell::new(1),
        });
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.is_none() {
                *current = Some(inner.clone());
            }
        });
        let lp = Loop { inner };
        let mut main = MAIN.lock().unwrap();
        if main.is_none() {
            *main = Some(lp.handle());
        }
        lp
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.inner.shared.clone(),
        }
    }

    pub(crate) fn from_inner(inner: Rc<Inner>) -> Loop {
        Loop { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<Inner> {
        &self.inner
    }

    pub(crate) fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    fn assert_thread(&self) {
        assert_eq!(
            thread::current().id(),
            self.inner.thread,
            "loop driven from a foreign thread"
        );
    }

    /// Runs the loop until [`Handle::shutdown`] is called.
    pub fn run(&self) {
        self.run_until(|| false);
    }

    /// Runs the loop until `stop` returns true or the loop is shut down.
    pub fn run_until(&self, mut stop: impl FnMut() -> bool) {
        self.assert_thread();
        while !self.handle().is_shutdown() && !stop() {
            self.run_once(true);
        }
    }

    /// Runs the loop until it has no live work left: no sessions, no
    /// listeners, no pending timers, no detached tasks, and nothing queued.
    pub fn run_until_complete(&self) {
        self.run_until(|| self.is_idle());
    }

    /// Starts `task` and drives the loop until it completes.
    ///
    /// Returns [`Error::Shutdown`] if the loop is shut down first.
    pub fn run_task<T: 'static>(&self, task: Task<T>) -> Result<T> {
        self.assert_thread();
        task.start();
        self.run_until(|| task.done());
        if task.done() {
            task.get()
        } else {
            Err(Error::Shutdown)
        }
    }

    /// Performs one loop iteration: drains injected messages, polls for I/O
    /// readiness, and fires due timers.
    ///
    /// With `block` set, waits until the next timer deadline or an event;
    /// otherwise returns immediately if nothing is ready.
    pub fn run_once(&self, block: bool) {
        self.assert_thread();
        self.drain_messages();
        if self.handle().is_shutdown() {
            return;
        }

        let timeout = if block {
            self.next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        } else {
            Some(Duration::ZERO)
        };
        match self.inner.reactor.poll(timeout) {
            Ok(_woken) => {}
            Err(err) => {
                debug!("reactor poll failed", { error: err.to_string() });
            }
        }

        self.drain_messages();
        self.fire_timers();
    }

    fn is_idle(&self) -> bool {
        self.inner.timers.borrow().is_empty()
            && self.inner.detached.borrow().is_empty()
            && self.inner.sessions.borrow().is_empty()
            && self.inner.listeners.borrow().is_empty()
            && self.inner.shared.queue.lock().unwrap().is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .timers
            .borrow()
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    fn drain_messages(&self) {
        loop {
            let batch: Vec<Message> =
                std::mem::take(&mut *self.inner.shared.queue.lock().unwrap());
            if batch.is_empty() {
                return;
            }
            for message in batch {
                match message {
                    Message::Resume(id) => self.poll_task(id),
                    Message::Run { delay, action } => {
                        if delay.is_zero() {
                            action();
                        } else {
                            self.defer_at(Instant::now() + delay, action);
                        }
                    }
                    Message::Keep { id, core } => self.keep_detached(id, core),
                }
            }
        }
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        loop {
            let action = {
                let mut timers = self.inner.timers.borrow_mut();
                match timers.keys().next().copied() {
                    Some(key) if key.0 <= now => timers.remove(&key),
                    _ => None,
                }
            };
            match action {
                Some(action) => action(),
                None => return,
            }
        }
    }

    /// Schedules `action` to run on the next loop iteration.
    pub fn defer(&self, action: impl FnOnce() + 'static) {
        self.defer_at(Instant::now(), action);
    }

    /// Schedules `action` to run after `delay`.
    pub fn defer_for(&self, delay: Duration, action: impl FnOnce() + 'static) {
        self.defer_at(Instant::now() + delay, action);
    }

    /// Schedules `action` to run once `deadline` has passed.
    pub fn defer_at(&self, deadline: Instant, action: impl FnOnce() + 'static) {
        self.assert_thread();
        let seq = self.inner.timer_seq.get();
        self.inner.timer_seq.set(seq + 1);
        self.inner
            .timers
            .borrow_mut()
            .insert((deadline, seq), Box::new(action));
    }

    /// Looks up a session by id.
    pub fn session(&self, id: SessionId) -> Result<Rc<Session>> {
        self.inner
            .sessions
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(Error::SessionNotFound(id))
    }

    pub(crate) fn add_session(&self, session: Rc<Session>) {
        trace!("session added", { session_id: session.id() });
        self.inner.sessions.borrow_mut().insert(session.id(), session);
    }

    pub(crate) fn remove_session(&self, id: SessionId) {
        trace!("session removed", { session_id: id });
        self.inner.sessions.borrow_mut().remove(&id);
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        let id = self.inner.next_session.get();
        self.inner.next_session.set(id + 1);
        id
    }

    /// Binds a listener that wraps each accepted connection in a session
    /// produced by `factory`.
    pub fn listen(&self, addr: SocketAddr, factory: SessionFactory) -> Result<Rc<Listener>> {
        self.assert_thread();
        let listener = Listener::bind(self, addr, factory)?;
        self.inner.listeners.borrow_mut().push(listener.clone());
        Ok(listener)
    }

    pub(crate) fn register_task(&self, id: TaskId, task: ArcWeak<dyn Pollable + Send + Sync>) {
        self.inner.tasks.borrow_mut().insert(id, task);
    }

    pub(crate) fn forget_task(&self, id: TaskId) {
        self.inner.tasks.borrow_mut().remove(&id);
    }

    /// Resumes a registered task by id, pruning the entry if the task has
    /// been destroyed since the resumption was scheduled.
    pub(crate) fn poll_task(&self, id: TaskId) {
        let task = self.inner.tasks.borrow().get(&id).cloned();
        match task.and_then(|weak| weak.upgrade()) {
            Some(task) => task.resume_by_ref(),
            None => {
                trace!("resume dropped for dead task", { task_id: id.as_u64() });
                self.forget_task(id);
            }
        }
    }

    /// Adopts a detached task, holding it alive until it completes. An
    /// unstarted task is started here; its result is discarded either way.
    pub(crate) fn keep_detached(&self, id: TaskId, core: Arc<dyn Pollable + Send + Sync>) {
        if core.is_done() {
            self.forget_task(id);
            return;
        }
        let weak = Rc::downgrade(&self.inner);
        core.add_observer(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.detached.borrow_mut().remove(&id);
                inner.tasks.borrow_mut().remove(&id);
            }
        }));
        self.inner.detached.borrow_mut().insert(id, core.clone());
        if !core.mark_started() {
            core.resume_by_ref();
        }
    }
}

impl Default for Loop {
    fn default() -> Loop {
        Loop::new()
    }
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loop")
            .field("thread", &self.inner.thread)
            .field("sessions", &self.inner.sessions.borrow().len())
            .field("timers", &self.inner.timers.borrow().len())
            .finish()
    }
}

// The loop's registries are only touched from its owning thread; `Weak<Inner>`
// references handed to observers are upgraded there too.
impl Drop for Inner {
    fn drop(&mut self) {
        debug!("event loop dropped", {
            pending_timers: self.timers.borrow().len(),
            detached_tasks: self.detached.borrow().len(),
        });
    }
}
