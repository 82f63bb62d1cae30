use std::thread;
use std::time::Duration;

use strand::{task, Error, FutureCell, Loop};

#[test]
fn wait_after_resolve_never_suspends() {
    let lp = Loop::new();
    let value = lp
        .run_task(task::spawn(async {
            let cell = FutureCell::new();
            cell.resolve(17);
            cell.wait().await
        }))
        .unwrap();
    assert_eq!(value, 17);
}

#[test]
fn failed_cell_yields_the_error() {
    let lp = Loop::new();
    let result: Result<(), _> = lp.run_task(task::spawn(async {
        let cell = FutureCell::new();
        cell.fail(Error::Closed);
        cell.wait().await
    }));
    assert!(matches!(result, Err(Error::Closed)));
}

#[test]
fn reset_makes_the_cell_reusable() {
    let lp = Loop::new();
    let (a, b) = lp
        .run_task(task::spawn(async {
            let cell = FutureCell::new();
            cell.resolve(1);
            let a = cell.wait().await?;
            cell.resolve(2);
            cell.reset();
            cell.resolve(3);
            let b = cell.wait().await?;
            Ok((a, b))
        }))
        .unwrap();
    assert_eq!((a, b), (1, 3));
}

#[test]
#[should_panic(expected = "resolved twice")]
fn double_resolve_panics() {
    let cell = FutureCell::new();
    cell.resolve(1);
    cell.resolve(2);
}

#[test]
fn resolution_resumes_the_awaiter_before_later_actions() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let lp = Loop::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    let cell = FutureCell::new();

    let waiter = cell.clone();
    let seen = order.clone();
    let t = task::spawn(async move {
        waiter.wait().await?;
        seen.borrow_mut().push("awaiter");
        Ok(())
    });
    t.start();

    let resolver = cell.clone();
    let seen = order.clone();
    lp.defer(move || {
        resolver.resolve(());
        seen.borrow_mut().push("resolver");
    });
    let seen = order.clone();
    lp.defer(move || seen.borrow_mut().push("unrelated"));

    lp.run_until(|| order.borrow().len() == 3);
    // The same-thread wake runs the awaiter inline, ahead of everything
    // scheduled after the resolving action.
    assert_eq!(*order.borrow(), vec!["awaiter", "resolver", "unrelated"]);
}

#[test]
fn resolve_from_another_thread_wakes_the_awaiter() {
    let lp = Loop::new();
    let cell = FutureCell::new();
    let producer = cell.clone();
    let resolver = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        producer.resolve("from afar");
    });
    let value = lp
        .run_task(task::spawn(async move { cell.wait().await }))
        .unwrap();
    assert_eq!(value, "from afar");
    resolver.join().unwrap();
}
