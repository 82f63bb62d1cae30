//! Sessions bridge socket I/O to coroutine-style processing.
//!
//! A [`Session`] owns one TCP stream registered with its loop's reactor.
//! Incoming bytes accumulate in an input buffer; a [`Handler`] is asked to
//! process the buffer one task at a time, reporting how many bytes it
//! consumed. At most one processing task is ever in flight per session, so
//! handlers never see interleaved calls for the same connection.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use kv_log_macro::{debug, trace, warn};
use mio::net::TcpStream;
use mio::Token;

use crate::error::{Error, Result};
use crate::event_loop::{Inner, IoHandler, Loop};
use crate::future_cell::FutureCell;
use crate::task::{self, Task};

pub use listener::{Listener, SessionFactory};

mod listener;

/// Identifies a session within its loop.
pub type SessionId = u64;

/// Application logic attached to a [`Session`].
pub trait Handler: 'static {
    /// Processes buffered input, returning how many bytes were consumed.
    ///
    /// Returning `Ok(0)` means the buffer does not yet hold a complete unit
    /// of work; the handler is called again once more data arrives. The
    /// returned task may suspend; the session will not start another
    /// processing task until it completes.
    fn process(&self, session: &Rc<Session>, data: Vec<u8>) -> Task<usize>;

    /// Called once when the peer closes the connection.
    fn closed(&self, _session: &Rc<Session>) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// No transport attached yet.
    Detached,
    /// Connect in progress; not yet writable.
    Connecting,
    Open,
    /// Close requested, waiting for in-flight processing or buffered output.
    Closing,
    Closed,
}

struct Io {
    stream: TcpStream,
    token: Token,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
}

/// One TCP connection bound to a loop.
///
/// Sessions are loop-affine like tasks: all methods must be called on the
/// owning loop's thread. The loop keeps every session registered until it
/// closes, so dropping your `Rc` does not tear the connection down.
pub struct Session {
    id: SessionId,
    owner: Weak<Inner>,
    handler: Rc<dyn Handler>,
    state: Cell<State>,
    io: RefCell<Option<Io>>,
    /// A connect is in flight and `connected` still owes its verdict.
    connect_pending: Cell<bool>,
    connected: FutureCell<()>,
    flushed: FutureCell<()>,
    processor: RefCell<Option<Task<usize>>>,
}

impl Session {
    /// Creates an unconnected session; follow up with [`connect`](Session::connect).
    pub fn new(lp: &Loop, handler: impl Handler) -> Rc<Session> {
        Session::with_handler(lp, Rc::new(handler))
    }

    fn with_handler(lp: &Loop, handler: Rc<dyn Handler>) -> Rc<Session> {
        let session = Rc::new(Session {
            id: lp.next_session_id(),
            owner: Rc::downgrade(lp.inner()),
            handler,
            state: Cell::new(State::Detached),
            io: RefCell::new(None),
            connect_pending: Cell::new(false),
            connected: FutureCell::new(),
            flushed: FutureCell::new(),
            processor: RefCell::new(None),
        });
        lp.add_session(session.clone());
        session
    }

    /// Wraps an already-connected stream, as produced by a listener accept.
    pub fn from_stream(
        lp: &Loop,
        handler: impl Handler,
        stream: TcpStream,
    ) -> io::Result<Rc<Session>> {
        Session::from_stream_dyn(lp, Rc::new(handler), stream)
    }

    pub(crate) fn from_stream_dyn(
        lp: &Loop,
        handler: Rc<dyn Handler>,
        stream: TcpStream,
    ) -> io::Result<Rc<Session>> {
        let session = Session::with_handler(lp, handler);
        session.attach(stream, State::Open)?;
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.state.get() == State::Open
    }

    /// The loop this session belongs to, unless it has been dropped.
    pub fn owner(&self) -> Option<Loop> {
        self.owner.upgrade().map(Loop::from_inner)
    }

    fn attach(self: &Rc<Self>, mut stream: TcpStream, state: State) -> io::Result<()> {
        assert!(
            self.io.borrow().is_none(),
            "session already has a transport"
        );
        let lp = self.owner().expect("session outlived its loop");
        let handler: Weak<dyn IoHandler> = Rc::<Session>::downgrade(self);
        let token = lp.reactor().register(&mut stream, handler)?;
        *self.io.borrow_mut() = Some(Io {
            stream,
            token,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
        });
        self.state.set(state);
        trace!("session transport attached", { session_id: self.id });
        Ok(())
    }

    /// Starts connecting to `addr` and returns a task that completes once
    /// the connection is established.
    pub fn connect(self: &Rc<Self>, addr: SocketAddr) -> Task<()> {
        let session = self.clone();
        task::spawn(async move {
            session.begin_connect(addr)?;
            session.connected.wait().await
        })
    }

    fn begin_connect(self: &Rc<Self>, addr: SocketAddr) -> Result<()> {
        let stream = TcpStream::connect(addr)?;
        self.attach(stream, State::Connecting)?;
        self.connect_pending.set(true);
        debug!("session connecting", {
            session_id: self.id,
            peer: addr.to_string(),
        });
        Ok(())
    }

    /// Queues `data` for sending. Bytes go out as the socket allows; await
    /// [`flush`](Session::flush) to learn when the buffer has drained.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        match self.state.get() {
            State::Closed | State::Closing => return Err(Error::Closed),
            _ => {}
        }
        {
            let mut io = self.io.borrow_mut();
            let io = io.as_mut().ok_or(Error::Closed)?;
            io.outbuf.extend_from_slice(data);
        }
        if self.state.get() == State::Open {
            self.flush_out();
        }
        Ok(())
    }

    /// Returns a task that completes once all currently buffered output has
    /// reached the socket.
    pub fn flush(self: &Rc<Self>) -> Task<()> {
        let session = self.clone();
        task::spawn(async move {
            let pending = session
                .io
                .borrow()
                .as_ref()
                .map_or(0, |io| io.outbuf.len());
            if pending == 0 {
                return Ok(());
            }
            session.flushed.reset();
            session.flushed.wait().await
        })
    }

    /// Discards `n` consumed bytes from the front of the input buffer.
    fn used(&self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(io) = self.io.borrow_mut().as_mut() {
            let n = n.min(io.inbuf.len());
            io.inbuf.drain(..n);
        }
    }

    /// Requests an orderly close. The session lingers until in-flight
    /// processing finishes and buffered output drains, then tears down.
    pub fn close(self: &Rc<Self>) {
        match self.state.get() {
            State::Closed => return,
            _ => self.state.set(State::Closing),
        }
        if self.processor.borrow().is_some() {
            return;
        }
        let pending = self
            .io
            .borrow()
            .as_ref()
            .map_or(0, |io| io.outbuf.len());
        if pending > 0 {
            return;
        }
        self.close_now();
    }

    fn close_now(self: &Rc<Self>) {
        self.state.set(State::Closed);
        if let Some(mut io) = self.io.borrow_mut().take() {
            if let Some(lp) = self.owner() {
                if let Err(err) = lp.reactor().deregister(&mut io.stream, io.token) {
                    warn!("session deregister failed", {
                        session_id: self.id,
                        error: err.to_string(),
                    });
                }
            }
            if !io.outbuf.is_empty() && !self.flushed.is_resolved() {
                self.flushed.fail(Error::Closed);
            }
        }
        // The pending flag, not the current state, decides this: `close()`
        // overwrites a `Connecting` state with `Closing` before teardown.
        if self.connect_pending.replace(false) && !self.connected.is_resolved() {
            self.connected.fail(Error::Closed);
        }
        debug!("session closed", { session_id: self.id });
        // Removal is deferred so a close from inside a readiness callback
        // does not free the session mid-call.
        let id = self.id;
        let owner = self.owner.clone();
        if let Some(lp) = self.owner() {
            lp.defer(move || {
                if let Some(inner) = owner.upgrade() {
                    Loop::from_inner(inner).remove_session(id);
                }
            });
        }
    }

    /// Pushes buffered output to the socket until it drains or the socket
    /// stops accepting.
    fn flush_out(&self) {
        let drained = {
            let mut io = self.io.borrow_mut();
            let io = match io.as_mut() {
                Some(io) => io,
                None => return,
            };
            while !io.outbuf.is_empty() {
                match io.stream.write(&io.outbuf) {
                    Ok(n) => {
                        io.outbuf.drain(..n);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!("session write failed", {
                            session_id: self.id,
                            error: err.to_string(),
                        });
                        break;
                    }
                }
            }
            io.outbuf.is_empty()
        };
        if drained && !self.flushed.is_resolved() {
            self.flushed.resolve(());
        }
    }

    fn write_ready(self: &Rc<Self>) {
        if self.state.get() == State::Connecting {
            let outcome = self
                .io
                .borrow()
                .as_ref()
                .map(|io| match io.stream.take_error() {
                    Ok(Some(err)) | Err(err) => Err(err),
                    // A connect has finished only once the peer address
                    // resolves; writability alone is not enough with mio.
                    Ok(None) => match io.stream.peer_addr() {
                        Ok(_) => Ok(true),
                        Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
                        Err(err) => Err(err),
                    },
                });
            match outcome {
                Some(Ok(true)) => {
                    self.state.set(State::Open);
                    self.connect_pending.set(false);
                    debug!("session connected", { session_id: self.id });
                    if !self.connected.is_resolved() {
                        self.connected.resolve(());
                    }
                }
                Some(Ok(false)) | None => return,
                Some(Err(err)) => {
                    self.connect_pending.set(false);
                    debug!("session connect failed", {
                        session_id: self.id,
                        error: err.to_string(),
                    });
                    if !self.connected.is_resolved() {
                        self.connected.fail(Error::Io(err));
                    }
                    self.close_now();
                    return;
                }
            }
        }
        self.flush_out();
        let drained = self
            .io
            .borrow()
            .as_ref()
            .map_or(true, |io| io.outbuf.is_empty());
        if drained && self.state.get() == State::Closing && self.processor.borrow().is_none() {
            self.close_now();
        }
    }

    fn read_ready(self: &Rc<Self>) {
        let mut eof = false;
        {
            let mut io = self.io.borrow_mut();
            let io = match io.as_mut() {
                Some(io) => io,
                None => return,
            };
            let mut chunk = [0u8; 4096];
            loop {
                match io.stream.read(&mut chunk) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => io.inbuf.extend_from_slice(&chunk[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!("session read failed", {
                            session_id: self.id,
                            error: err.to_string(),
                        });
                        eof = true;
                        break;
                    }
                }
            }
        }
        self.drive();
        if eof {
            trace!("session peer closed", { session_id: self.id });
            self.handler.closed(self);
            self.close();
        }
    }

    /// Feeds buffered input to the handler, one processing task at a time.
    ///
    /// A task that completes synchronously is consumed on the spot and the
    /// remaining buffer offered again; one that suspends is parked in
    /// `processor` and picked up by [`processing_complete`](Self::processing_complete).
    fn drive(self: &Rc<Self>) {
        if self.processor.borrow().is_some() {
            return;
        }
        loop {
            if self.state.get() != State::Open {
                return;
            }
            let data = match self.io.borrow().as_ref() {
                Some(io) if !io.inbuf.is_empty() => io.inbuf.clone(),
                _ => return,
            };
            let task = self.handler.process(self, data);
            task.start();
            if !task.done() {
                let session = self.clone();
                task.on_completed(move || session.processing_complete());
                *self.processor.borrow_mut() = Some(task);
                return;
            }
            match task.get() {
                Ok(0) => return,
                Ok(n) => self.used(n),
                Err(err) => {
                    warn!("session handler failed", {
                        session_id: self.id,
                        error: err.to_string(),
                    });
                    self.close();
                    return;
                }
            }
        }
    }

    fn processing_complete(self: &Rc<Self>) {
        let task = match self.processor.borrow_mut().take() {
            Some(task) => task,
            None => return,
        };
        match task.get() {
            Ok(n) => {
                self.used(n);
                if self.state.get() == State::Closing {
                    self.close();
                } else {
                    self.drive();
                }
            }
            Err(err) => {
                warn!("session handler failed", {
                    session_id: self.id,
                    error: err.to_string(),
                });
                self.close();
            }
        }
    }
}

impl IoHandler for Session {
    fn ready(self: Rc<Self>, readable: bool, writable: bool) {
        if writable {
            self.write_ready();
        }
        if readable && self.state.get() != State::Closed {
            self.read_ready();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .finish()
    }
}
