use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::event_loop;

/// Suspends the current task for at least the duration specified.
///
/// Never blocks the thread; the loop keeps dispatching other work and
/// resumes the sleeper once its deadline passes.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use strand::{task, Loop};
///
/// let lp = Loop::new();
/// lp.run_task(task::spawn(async {
///     strand::sleep(Duration::from_millis(10)).await;
///     Ok(())
/// }))
/// .unwrap();
/// ```
pub fn sleep(dur: Duration) -> Sleep {
    Sleep {
        dur,
        deadline: None,
    }
}

/// Future returned by [`sleep`].
#[derive(Debug)]
pub struct Sleep {
    dur: Duration,
    deadline: Option<Instant>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.deadline {
            None => {
                if self.dur.is_zero() {
                    return Poll::Ready(());
                }
                let deadline = Instant::now() + self.dur;
                self.deadline = Some(deadline);
                let waker = cx.waker().clone();
                event_loop::with_current(|lp| {
                    lp.defer_at(deadline, move || waker.wake());
                })
                .expect("sleep polled outside of an event loop");
                Poll::Pending
            }
            Some(deadline) => {
                if Instant::now() >= deadline {
                    Poll::Ready(())
                } else {
                    // Woken early, likely by a parent registration change.
                    // Re-arm for the remainder.
                    let waker = cx.waker().clone();
                    event_loop::with_current(|lp| {
                        lp.defer_at(deadline, move || waker.wake());
                    })
                    .expect("sleep polled outside of an event loop");
                    Poll::Pending
                }
            }
        }
    }
}
