use std::time::{Duration, Instant};

use strand::{gather, gather2, race, task, Error, Loop, Task};

fn after(delay: Duration, value: u32) -> Task<u32> {
    task::spawn(async move {
        strand::sleep(delay).await;
        Ok(value)
    })
}

#[test]
fn gather_preserves_spawn_order() {
    let lp = Loop::new();
    let values = lp
        .run_task(task::spawn(async {
            let tasks = vec![
                after(Duration::from_millis(30), 0),
                after(Duration::from_millis(10), 1),
                after(Duration::ZERO, 2),
            ];
            gather(tasks).await
        }))
        .unwrap();
    assert_eq!(values, vec![0, 1, 2]);
}

#[test]
fn gather_runs_tasks_concurrently() {
    let lp = Loop::new();
    let started = Instant::now();
    lp.run_task(task::spawn(async {
        let tasks = (0..4)
            .map(|_| after(Duration::from_millis(40), 0))
            .collect();
        gather(tasks).await
    }))
    .unwrap();
    // Four 40ms sleeps overlap; sequential execution would take 160ms.
    assert!(started.elapsed() < Duration::from_millis(120));
}

#[test]
fn gather_reports_the_first_error() {
    let lp = Loop::new();
    let result = lp.run_task(task::spawn(async {
        let tasks = vec![
            after(Duration::from_millis(5), 1),
            task::spawn(async { Err(Error::Closed) }),
        ];
        gather(tasks).await
    }));
    assert!(matches!(result, Err(Error::Closed)));
}

#[test]
fn gather2_mixes_result_types() {
    let lp = Loop::new();
    let (n, s) = lp
        .run_task(task::spawn(async {
            gather2(
                task::spawn(async { Ok(7) }),
                task::spawn(async { Ok("seven") }),
            )
            .await
        }))
        .unwrap();
    assert_eq!(n, 7);
    assert_eq!(s, "seven");
}

#[test]
fn race_returns_the_fastest() {
    let lp = Loop::new();
    let winner = lp
        .run_task(task::spawn(async {
            race(vec![
                after(Duration::from_millis(50), 1),
                after(Duration::from_millis(5), 2),
            ])
            .await
        }))
        .unwrap();
    assert_eq!(winner, 2);
}

#[test]
fn race_times_out() {
    let lp = Loop::new();
    let result = lp.run_task(task::spawn(async {
        race(vec![after(Duration::from_secs(60), 1)])
            .timeout(Duration::from_millis(20))
            .await
    }));
    assert!(matches!(result, Err(Error::Timeout)));
}

#[test]
fn race_predicate_skips_unqualified_winners() {
    let lp = Loop::new();
    let winner = lp
        .run_task(task::spawn(async {
            race(vec![
                after(Duration::from_millis(5), 1),
                after(Duration::from_millis(20), 10),
            ])
            .predicate(|value| *value >= 10)
            .await
        }))
        .unwrap();
    assert_eq!(winner, 10);
}

#[test]
fn race_losers_keep_running() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let lp = Loop::new();
    let loser_done = Arc::new(AtomicBool::new(false));
    let flag = loser_done.clone();
    let winner = lp
        .run_task(task::spawn(async move {
            let slow = task::spawn(async move {
                strand::sleep(Duration::from_millis(30)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(1)
            });
            race(vec![slow, after(Duration::from_millis(5), 2)]).await
        }))
        .unwrap();
    assert_eq!(winner, 2);
    assert!(!loser_done.load(Ordering::SeqCst));
    lp.run_until(|| loser_done.load(Ordering::SeqCst));
}
