//! Loop-affine tasks and task-local futures.
//!
//! A [`Task`] wraps a future whose body runs only on the event loop it was
//! spawned on. The handle itself may travel between threads; starting or
//! dropping it from a foreign thread routes the work back to the owning loop
//! over its injector queue. An [`InstantTask`] skips the loop entirely for
//! short inline coroutines.
//!
//! Tasks are lazy. Nothing runs until the task is started, awaited, or given
//! to [`Loop::run_task`](crate::Loop::run_task).

pub use instant::InstantTask;
pub use sleep::{sleep, Sleep};
pub use task::{spawn, spawn_on, Task};
pub use task_id::TaskId;

pub(crate) use raw::Pollable;

mod instant;
mod raw;
mod sleep;
mod task;
mod task_id;
