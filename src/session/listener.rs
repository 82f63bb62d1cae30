use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use kv_log_macro::{debug, warn};
use mio::net::{TcpListener, TcpStream};
use mio::Token;

use crate::error::Result;
use crate::event_loop::{Inner, IoHandler, Loop};
use crate::session::Session;

/// Builds a session around each accepted connection.
pub type SessionFactory = Box<dyn Fn(&Loop, TcpStream) -> io::Result<Rc<Session>>>;

/// Accepts TCP connections and hands each one to a [`SessionFactory`].
///
/// The loop holds the listener for as long as it is bound; accepted sessions
/// are registered with the loop by the factory via [`Session::from_stream`].
pub struct Listener {
    local_addr: SocketAddr,
    owner: Weak<Inner>,
    io: std::cell::RefCell<Option<(TcpListener, Token)>>,
    factory: SessionFactory,
}

impl Listener {
    pub(crate) fn bind(lp: &Loop, addr: SocketAddr, factory: SessionFactory) -> Result<Rc<Listener>> {
        let mut socket = TcpListener::bind(addr)?;
        let local_addr = socket.local_addr()?;
        let listener = Rc::new(Listener {
            local_addr,
            owner: Rc::downgrade(lp.inner()),
            io: std::cell::RefCell::new(None),
            factory,
        });
        let handler: Weak<dyn IoHandler> = Rc::<Listener>::downgrade(&listener);
        let token = lp.reactor().register(&mut socket, handler)?;
        *listener.io.borrow_mut() = Some((socket, token));
        debug!("listener bound", { addr: local_addr.to_string() });
        Ok(listener)
    }

    /// The address actually bound, with any ephemeral port filled in.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl IoHandler for Listener {
    fn ready(self: Rc<Self>, readable: bool, _writable: bool) {
        if !readable {
            return;
        }
        let lp = match self.owner.upgrade() {
            Some(inner) => Loop::from_inner(inner),
            None => return,
        };
        loop {
            let accepted = match self.io.borrow().as_ref() {
                Some((socket, _)) => socket.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!("connection accepted", { peer: peer.to_string() });
                    if let Err(err) = (self.factory)(&lp, stream) {
                        warn!("session factory failed", { error: err.to_string() });
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("accept failed", { error: err.to_string() });
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
