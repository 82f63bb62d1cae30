use std::cell::RefCell;
use std::io;
use std::rc::Weak;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;

/// Receives readiness events for one registered I/O source.
///
/// Implementors are held weakly; a handler that has been dropped is pruned
/// the next time its token fires.
pub(crate) trait IoHandler {
    fn ready(self: std::rc::Rc<Self>, readable: bool, writable: bool);
}

/// Token reserved for the loop's cross-thread waker.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// The state of a `Loop` instance's I/O driver.
///
/// Entries are stored in a slab; the slab index becomes the `mio` token for
/// the registered source.
pub(crate) struct Reactor {
    poll: RefCell<Poll>,
    registry: Registry,
    events: RefCell<Events>,
    entries: RefCell<Slab<Weak<dyn IoHandler>>>,
}

impl Reactor {
    /// Creates the poller plus the waker other threads use to interrupt it.
    pub(crate) fn new() -> io::Result<(Reactor, mio::Waker)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        let reactor = Reactor {
            poll: RefCell::new(poll),
            registry,
            events: RefCell::new(Events::with_capacity(1024)),
            entries: RefCell::new(Slab::new()),
        };
        Ok((reactor, waker))
    }

    /// Registers an I/O source for both readable and writable interest.
    pub(crate) fn register(
        &self,
        source: &mut impl Source,
        handler: Weak<dyn IoHandler>,
    ) -> io::Result<Token> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries.vacant_entry();
        let token = Token(entry.key());
        self.registry
            .register(source, token, Interest::READABLE | Interest::WRITABLE)?;
        entry.insert(handler);
        Ok(token)
    }

    pub(crate) fn deregister(&self, source: &mut impl Source, token: Token) -> io::Result<()> {
        self.entries.borrow_mut().try_remove(token.0);
        self.registry.deregister(source)
    }

    /// Waits for events up to `timeout` and dispatches them.
    ///
    /// Returns `true` if the waker fired, meaning the injector queue may have
    /// messages to drain.
    pub(crate) fn poll(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut events = self.events.borrow_mut();
        if let Err(err) = self.poll.borrow_mut().poll(&mut events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        let mut woken = false;
        let mut ready = Vec::new();
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                woken = true;
                continue;
            }
            let readable = event.is_readable() || event.is_read_closed();
            let writable = event.is_writable() || event.is_write_closed();
            ready.push((event.token(), readable, writable));
        }
        drop(events);

        // Dispatch with no reactor borrows held; a handler may register or
        // deregister sources from inside `ready`.
        for (token, readable, writable) in ready {
            let handler = self.entries.borrow().get(token.0).cloned();
            match handler.and_then(|weak| weak.upgrade()) {
                Some(handler) => handler.ready(readable, writable),
                None => {
                    self.entries.borrow_mut().try_remove(token.0);
                }
            }
        }
        Ok(woken)
    }
}
