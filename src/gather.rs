//! Combinators for waiting on several tasks at once.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::task::{self, sleep, Task};

/// Awaits every task and collects their values in spawn order.
///
/// All tasks are started before any is awaited, so they make progress
/// concurrently. If any task fails, the first failure (in spawn order, not
/// completion order) is returned once every task has finished; the rest of
/// the results are discarded.
///
/// # Examples
///
/// ```
/// use strand::{gather, task, Loop};
///
/// let lp = Loop::new();
/// let tasks: Vec<_> = (0..3).map(|i| task::spawn(async move { Ok(i * 2) })).collect();
/// let values = lp
///     .run_task(task::spawn(async move { gather(tasks).await }))
///     .unwrap();
/// assert_eq!(values, vec![0, 2, 4]);
/// ```
pub async fn gather<T: 'static>(tasks: Vec<Task<T>>) -> Result<Vec<T>> {
    for task in &tasks {
        task.start();
    }
    let mut values = Vec::with_capacity(tasks.len());
    let mut first_err = None;
    for mut task in tasks {
        match (&mut task).await {
            Ok(value) => values.push(value),
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(values),
    }
}

/// Awaits two tasks of different types, returning both values.
pub async fn gather2<A: 'static, B: 'static>(a: Task<A>, b: Task<B>) -> Result<(A, B)> {
    a.start();
    b.start();
    let (mut a, mut b) = (a, b);
    let ra = (&mut a).await;
    let rb = (&mut b).await;
    match (ra, rb) {
        (Ok(a), Ok(b)) => Ok((a, b)),
        (Err(err), _) | (_, Err(err)) => Err(err),
    }
}

/// Awaits the first task to finish, leaving the rest running.
///
/// The returned [`Race`] resolves with the winner's result; an error wins
/// outright. Losing tasks are not cancelled: they are detached to their loop
/// and run to completion in the background, their results discarded.
///
/// Use [`Race::timeout`] to bound the wait and [`Race::predicate`] to skip
/// completed values that do not qualify as winners.
pub fn race<T: 'static>(tasks: Vec<Task<T>>) -> Race<T, fn(&T) -> bool> {
    Race {
        tasks,
        timer: None,
        timeout: None,
        predicate: |_| true,
        started: false,
    }
}

/// Future returned by [`race`].
pub struct Race<T: 'static, P> {
    tasks: Vec<Task<T>>,
    timer: Option<Task<()>>,
    timeout: Option<Duration>,
    predicate: P,
    started: bool,
}

impl<T: 'static, P> Race<T, P> {
    /// Resolves with [`Error::Timeout`] if no task qualifies within `dur`.
    /// All contenders are detached, as losers.
    pub fn timeout(mut self, dur: Duration) -> Race<T, P> {
        self.timeout = Some(dur);
        self
    }

    /// Only counts a completed value as the winner if `predicate` accepts
    /// it. Rejected tasks are dropped; errors still win unconditionally.
    pub fn predicate<Q>(self, predicate: Q) -> Race<T, Q>
    where
        Q: FnMut(&T) -> bool,
    {
        Race {
            tasks: self.tasks,
            timer: self.timer,
            timeout: self.timeout,
            predicate,
            started: self.started,
        }
    }
}

fn finish_losers<T: 'static>(tasks: &mut Vec<Task<T>>) {
    for task in tasks.drain(..) {
        task.clear_parent();
        task.detach();
    }
}

impl<T: 'static, P> Future for Race<T, P>
where
    P: FnMut(&T) -> bool + Unpin,
{
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if !this.started {
            this.started = true;
            for task in &this.tasks {
                task.start();
            }
            if let Some(dur) = this.timeout {
                let timer = task::spawn(async move {
                    sleep(dur).await;
                    Ok(())
                });
                timer.start();
                this.timer = Some(timer);
            }
        }

        let Race {
            tasks, predicate, ..
        } = this;
        let mut i = 0;
        while i < tasks.len() {
            if !tasks[i].done() {
                i += 1;
                continue;
            }
            let wins = tasks[i]
                .peek(|result| match result {
                    Ok(value) => predicate(value),
                    Err(_) => true,
                })
                .unwrap_or(false);
            if wins {
                let winner = tasks.swap_remove(i);
                finish_losers(tasks);
                this.timer = None;
                return Poll::Ready(winner.get());
            }
            // Completed but disqualified; no longer a contender.
            drop(tasks.swap_remove(i));
        }

        if let Some(timer) = &this.timer {
            if timer.done() {
                finish_losers(&mut this.tasks);
                this.timer = None;
                return Poll::Ready(Err(Error::Timeout));
            }
        }

        if this.tasks.is_empty() && this.timer.is_none() {
            // Every contender was disqualified and no timeout is armed.
            return Poll::Ready(Err(Error::Timeout));
        }

        for task in &this.tasks {
            task.set_parent(cx.waker());
        }
        if let Some(timer) = &this.timer {
            timer.set_parent(cx.waker());
        }
        Poll::Pending
    }
}
