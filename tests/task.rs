use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strand::{task, Error, InstantTask, Loop};

#[test]
fn run_task_returns_value() {
    let lp = Loop::new();
    let answer = lp.run_task(task::spawn(async { Ok(6 * 7) })).unwrap();
    assert_eq!(answer, 42);
}

#[test]
fn spawned_task_is_lazy() {
    let lp = Loop::new();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let t = task::spawn(async move {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    assert!(!t.started());
    assert!(!ran.load(Ordering::SeqCst));
    assert!(t.start());
    assert!(ran.load(Ordering::SeqCst));
    assert!(t.done());
    lp.run_task(task::spawn(async { Ok(()) })).unwrap();
}

#[test]
fn start_runs_inline_until_first_suspension() {
    let _lp = Loop::new();
    let before = Arc::new(AtomicBool::new(false));
    let after = Arc::new(AtomicBool::new(false));
    let (b, a) = (before.clone(), after.clone());
    let t = task::spawn(async move {
        b.store(true, Ordering::SeqCst);
        strand::sleep(Duration::from_millis(5)).await;
        a.store(true, Ordering::SeqCst);
        Ok(())
    });
    assert!(!t.start());
    assert!(before.load(Ordering::SeqCst));
    assert!(!after.load(Ordering::SeqCst));
}

#[test]
#[should_panic(expected = "not complete")]
fn get_before_completion_panics() {
    let _lp = Loop::new();
    let t = task::spawn(async {
        strand::sleep(Duration::from_secs(10)).await;
        Ok(())
    });
    let _ = t.get();
}

#[test]
fn double_consumption_is_a_task_panic() {
    let lp = Loop::new();
    let result: Result<(), _> = lp.run_task(task::spawn(async {
        let mut inner = task::spawn(async { Ok(5) });
        let _ = (&mut inner).await;
        inner.get().map(|_| ())
    }));
    match result {
        Err(Error::Panicked(msg)) => assert!(msg.contains("consumed"), "got: {}", msg),
        other => panic!("expected a panicked task, got {:?}", other),
    }
}

#[test]
fn panicking_body_becomes_an_error() {
    let lp = Loop::new();
    let result: Result<(), _> = lp.run_task(task::spawn(async { panic!("boom") }));
    match result {
        Err(Error::Panicked(msg)) => assert_eq!(msg, "boom"),
        other => panic!("expected a panicked task, got {:?}", other),
    }
}

#[test]
fn dropped_task_suppresses_pending_resume() {
    let lp = Loop::new();
    let t = task::spawn(async {
        strand::sleep(Duration::from_millis(5)).await;
        Ok(())
    });
    t.start();
    drop(t);
    // The timer still fires; the wake finds no task and evaporates.
    lp.run_task(task::spawn(async {
        strand::sleep(Duration::from_millis(20)).await;
        Ok(())
    }))
    .unwrap();
}

#[test]
fn task_started_from_another_thread() {
    let lp = Loop::new();
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let t = task::spawn(async move {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    let starter = thread::spawn(move || {
        t.start();
        drop(t);
    });
    lp.run_until(|| done.load(Ordering::SeqCst));
    starter.join().unwrap();
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn instant_task_runs_without_a_loop() {
    let t = InstantTask::new(async { Ok("inline") });
    assert!(t.start());
    assert_eq!(t.get().unwrap(), "inline");
}

#[test]
fn instant_task_observer_fires_on_completion() {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let t = InstantTask::new(async { Ok(()) });
    t.on_completed(move || flag.store(true, Ordering::SeqCst));
    assert!(!fired.load(Ordering::SeqCst));
    t.start();
    assert!(fired.load(Ordering::SeqCst));
}

#[test]
fn instant_task_drops_foreign_wakes() {
    let cell = strand::FutureCell::new();
    let waiter = cell.clone();
    let t = InstantTask::new(async move { waiter.wait().await });
    assert!(!t.start());

    let producer = cell.clone();
    thread::spawn(move || producer.resolve(7)).join().unwrap();

    // The wake has no loop to route through; it is dropped, not delivered
    // on the wrong thread and not a panic.
    assert!(!t.done());
}

#[test]
fn detached_task_runs_to_completion() {
    let lp = Loop::new();
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    let t = task::spawn(async move {
        strand::sleep(Duration::from_millis(5)).await;
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    t.detach();
    lp.run_until(|| done.load(Ordering::SeqCst));
    assert!(done.load(Ordering::SeqCst));
}
