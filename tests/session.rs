use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use strand::{task, Error, Handler, Loop, Session, Task};

fn init_logs() {
    static START: Once = Once::new();
    START.call_once(|| femme::with_level(log::LevelFilter::Warn));
}

/// Writes every byte straight back and consumes it all.
struct Echo;

impl Handler for Echo {
    fn process(&self, session: &Rc<Session>, data: Vec<u8>) -> Task<usize> {
        let session = session.clone();
        task::spawn(async move {
            session.write(&data)?;
            Ok(data.len())
        })
    }
}

/// Echoes after a suspension, exercising the async completion path.
struct SlowEcho;

impl Handler for SlowEcho {
    fn process(&self, session: &Rc<Session>, data: Vec<u8>) -> Task<usize> {
        let session = session.clone();
        task::spawn(async move {
            strand::sleep(Duration::from_millis(5)).await;
            session.write(&data)?;
            Ok(data.len())
        })
    }
}

/// Consumes fixed 40-byte frames, refusing shorter buffers.
struct Framed {
    calls: Rc<RefCell<Vec<usize>>>,
    leftover_seen: Rc<Cell<bool>>,
}

impl Handler for Framed {
    fn process(&self, _session: &Rc<Session>, data: Vec<u8>) -> Task<usize> {
        self.calls.borrow_mut().push(data.len());
        if data.len() == 20 {
            self.leftover_seen.set(true);
        }
        let consumed = if data.len() >= 40 { 40 } else { 0 };
        task::spawn(async move { Ok(consumed) })
    }
}

/// Never asked to process anything; used for outbound-only sessions.
struct Quiet;

impl Handler for Quiet {
    fn process(&self, _session: &Rc<Session>, _data: Vec<u8>) -> Task<usize> {
        task::spawn(async { Ok(0) })
    }
}

fn echo_roundtrip(handler_kind: &'static str) {
    init_logs();
    let lp = Loop::new();
    let factory: strand::SessionFactory = match handler_kind {
        "slow" => Box::new(|lp, stream| Session::from_stream(lp, SlowEcho, stream)),
        _ => Box::new(|lp, stream| Session::from_stream(lp, Echo, stream)),
    };
    let listener = lp.listen("127.0.0.1:0".parse().unwrap(), factory).unwrap();
    let addr = listener.local_addr();

    let handle = lp.handle();
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let client = thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello strand").unwrap();
        let mut buf = [0u8; 12];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello strand");
        handle.defer(Duration::ZERO, move || flag.store(true, Ordering::SeqCst));
    });

    lp.run_until(|| done.load(Ordering::SeqCst));
    client.join().unwrap();
}

#[test]
fn accepted_session_echoes() {
    echo_roundtrip("sync");
}

#[test]
fn suspended_processing_still_echoes() {
    echo_roundtrip("slow");
}

#[test]
fn unconsumed_bytes_stay_buffered() {
    init_logs();
    let lp = Loop::new();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let leftover_seen = Rc::new(Cell::new(false));
    let (calls_h, leftover_h) = (calls.clone(), leftover_seen.clone());
    let factory: strand::SessionFactory = Box::new(move |lp, stream| {
        Session::from_stream(
            lp,
            Framed {
                calls: calls_h.clone(),
                leftover_seen: leftover_h.clone(),
            },
            stream,
        )
    });
    let listener = lp.listen("127.0.0.1:0".parse().unwrap(), factory).unwrap();
    let addr = listener.local_addr();

    let stop = Arc::new(AtomicBool::new(false));
    let hold = stop.clone();
    let client = thread::spawn(move || {
        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.write_all(&[7u8; 60]).unwrap();
        // Keep the connection open until the server has seen everything.
        while !hold.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
    });

    // One 40-byte frame is consumed; the trailing 20 bytes wait for more.
    lp.run_until(|| leftover_seen.get());
    stop.store(true, Ordering::SeqCst);
    client.join().unwrap();

    let calls = calls.borrow();
    assert_eq!(*calls.last().unwrap(), 20);
    assert!(calls.iter().any(|len| *len >= 40));
}

#[test]
fn connect_write_flush_close() {
    init_logs();
    let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let reader = thread::spawn(move || {
        let (mut conn, _) = server.accept().unwrap();
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).unwrap();
        buf
    });

    let lp = Loop::new();
    let session = Session::new(&lp, Quiet);
    let id = session.id();
    lp.run_task(session.connect(addr)).unwrap();
    assert!(session.is_open());

    session.write(b"ping").unwrap();
    lp.run_task(session.flush()).unwrap();
    session.close();
    lp.run_until(|| lp.session(id).is_err());

    assert_eq!(reader.join().unwrap(), b"ping");
}

#[test]
fn closing_mid_connect_fails_the_connect_task() {
    init_logs();
    let server = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();

    let lp = Loop::new();
    let session = Session::new(&lp, Quiet);
    let connect = session.connect(addr);
    connect.start();
    assert!(!connect.done());

    // Close before the loop ever sees the writable event.
    session.close();
    assert!(connect.done());
    assert!(matches!(connect.get(), Err(Error::Closed)));
}

#[test]
fn connecting_to_a_dead_port_fails_the_connect_task() {
    init_logs();
    // Bind then drop to get a port nothing is listening on.
    let addr = {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    };
    let lp = Loop::new();
    let session = Session::new(&lp, Quiet);
    let result = lp.run_task(session.connect(addr));
    assert!(matches!(result, Err(Error::Io(_)) | Err(Error::Closed)));
}

#[test]
fn unknown_session_lookup_fails() {
    let lp = Loop::new();
    assert!(matches!(
        lp.session(9999),
        Err(Error::SessionNotFound(9999))
    ));
}

#[test]
fn writing_to_a_closed_session_fails() {
    init_logs();
    let lp = Loop::new();
    let session = Session::new(&lp, Quiet);
    session.close();
    assert!(matches!(session.write(b"late"), Err(Error::Closed)));
}
